//! Test fixtures and client helpers.
//!
//! Provides clients over fresh in-process engines, reachable either directly
//! (embedded adapter) or through the wire model (cloud adapter over a
//! loopback service).

use dsclient_codec::Context;
use dsclient_core::{Client, ClientOptions};
use dsclient_storage::cloud::{CloudBackend, LoopbackService};
use dsclient_storage::embedded::EmbeddedBackend;
use dsclient_storage::Engine;
use std::sync::Arc;

/// A client over a private engine.
pub struct TestClient {
    /// The client under test.
    pub client: Client,
    /// The engine behind the client's backend.
    pub engine: Arc<Engine>,
    /// The loopback service, for cloud fixtures.
    pub service: Option<Arc<LoopbackService>>,
    /// A background context for the test.
    pub ctx: Context,
}

impl TestClient {
    /// Creates a client over the embedded adapter.
    pub fn embedded() -> Self {
        let engine = Arc::new(Engine::new());
        let backend = EmbeddedBackend::new(Arc::clone(&engine));
        Self {
            client: Client::new(Arc::new(backend), ClientOptions::default()),
            engine,
            service: None,
            ctx: Context::background(),
        }
    }

    /// Creates a client over the cloud adapter talking to a loopback
    /// service. Lookups answer at most two keys per call and query pages hold
    /// at most three rows, so deferral and paging are exercised.
    pub fn cloud() -> Self {
        let engine = Arc::new(Engine::new());
        let service = Arc::new(
            LoopbackService::new(Arc::clone(&engine))
                .with_lookup_limit(2)
                .with_page_limit(3),
        );
        let options = ClientOptions::new().project_id("testkit");
        let backend = CloudBackend::with_options("testkit", service.clone(), &options);
        Self {
            client: Client::new(Arc::new(backend), options),
            engine,
            service: Some(service),
            ctx: Context::background(),
        }
    }

    /// Both fixtures, for tests that must hold on every backend.
    pub fn all() -> Vec<Self> {
        vec![Self::embedded(), Self::cloud()]
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Runs a test with a client over a fresh embedded engine.
///
/// # Example
///
/// ```rust,ignore
/// use dsclient_testkit::with_test_client;
///
/// #[test]
/// fn my_test() {
///     with_test_client(|tc| {
///         let key = tc.id_key("Data", 1, None);
///         // ... test operations
///     });
/// }
/// ```
pub fn with_test_client<F, R>(f: F) -> R
where
    F: FnOnce(&TestClient) -> R,
{
    let tc = TestClient::embedded();
    f(&tc)
}

/// Runs a test once per backend fixture.
pub fn with_each_backend<F>(mut f: F)
where
    F: FnMut(&TestClient),
{
    for tc in TestClient::all() {
        f(&tc);
    }
}

/// Installs a tracing subscriber honouring `RUST_LOG`. Safe to call from
/// several tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
