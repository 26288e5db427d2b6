//! Cloud adapter.
//!
//! Translates the backend contract into the datastore wire model and sends
//! it through a [`RemoteService`]. Wire failures arrive as [`Status`] codes
//! and are translated into the client taxonomy at this edge.
//!
//! Without a configured transport the factory serves the project from a
//! [`LoopbackService`] over the process-global engine, which makes the
//! adapter usable as a local emulator.

mod adapter;
mod loopback;
mod service;
pub mod wire;

pub use adapter::{CloudBackend, CloudIterator, CloudTransaction};
pub use loopback::LoopbackService;
pub use service::{Call, RemoteService, Status, INVALID_KEY_PREFIX};

use crate::backend::Backend;
use crate::config::ClientOptions;
use crate::embedded::shared_engine;
use crate::registry::register_factory;
use dsclient_codec::{Context, DsError, DsResult};
use std::sync::Arc;
use tracing::debug;

/// Registry name of the adapter.
pub const NAME: &str = "cloud";

/// Installs this adapter as the process backend. Returns false if another
/// adapter registered first.
pub fn register() -> bool {
    register_factory(NAME, open)
}

/// Factory building a cloud backend.
///
/// # Errors
///
/// Returns [`DsError::Config`] when no project id can be resolved.
pub fn open(_ctx: &Context, options: &ClientOptions) -> DsResult<Arc<dyn Backend>> {
    let project = options
        .resolve_project_id()?
        .ok_or_else(|| DsError::config("cloud backend requires a project id"))?;
    let service: Arc<dyn RemoteService> = match &options.transport {
        Some(transport) => Arc::clone(transport),
        None => Arc::new(LoopbackService::new(shared_engine(&project))),
    };
    debug!(%project, "opening cloud backend");
    Ok(Arc::new(CloudBackend::with_options(project, service, options)))
}
