//! Process-global backend factory registry.
//!
//! Each adapter's `register()` installs its factory here. The first
//! registration wins; later ones are ignored, so exactly one adapter is
//! active per process.

use crate::backend::Backend;
use crate::config::ClientOptions;
use dsclient_codec::{Context, DsError, DsResult};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::debug;

/// Builds a backend for a client.
pub type BackendFactory = fn(&Context, &ClientOptions) -> DsResult<Arc<dyn Backend>>;

static FACTORY: OnceCell<(&'static str, BackendFactory)> = OnceCell::new();

/// Registers the process backend factory.
///
/// Returns true if this call installed it, false if another factory was
/// registered first.
pub fn register_factory(name: &'static str, factory: BackendFactory) -> bool {
    let installed = FACTORY.set((name, factory)).is_ok();
    if installed {
        debug!(backend = name, "backend factory registered");
    }
    installed
}

/// Name of the registered backend, if any.
#[must_use]
pub fn registered_backend() -> Option<&'static str> {
    FACTORY.get().map(|(name, _)| *name)
}

/// Builds a backend with the registered factory.
///
/// # Errors
///
/// Returns [`DsError::Config`] when no adapter registered, or the
/// factory's own error.
pub fn open_backend(ctx: &Context, options: &ClientOptions) -> DsResult<Arc<dyn Backend>> {
    let (_, factory) = FACTORY.get().ok_or_else(|| {
        DsError::config("no backend registered; call embedded::register() or cloud::register()")
    })?;
    factory(ctx, options)
}
