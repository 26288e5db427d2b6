//! # dsclient storage
//!
//! Backend adapters for the dsclient datastore client.
//!
//! A backend is the bottom of the middleware chain: it implements the full
//! operation set against one concrete datastore. Two adapters ship:
//!
//! - [`embedded`] - the legacy adapter, calling the in-process [`Engine`] directly
//! - [`cloud`] - speaks the datastore wire model through a [`cloud::RemoteService`]
//!
//! Exactly one adapter is active per process. Each exposes `register()`,
//! which installs its factory in the process-global [`registry`]; the first
//! registration wins.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dsclient_codec::{Context, Key, PropertyList};
//! use dsclient_storage::{embedded, open_backend, ClientOptions};
//!
//! embedded::register();
//! let ctx = Context::background();
//! let backend = open_backend(&ctx, &ClientOptions::new().project_id("demo")).unwrap();
//! let keys = backend
//!     .put_multi(&ctx, &[Key::incomplete_key("Data", None)], &[PropertyList::new()])
//!     .unwrap();
//! assert!(!keys[0].incomplete());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod cloud;
mod config;
pub mod embedded;
mod engine;
mod error;
pub mod registry;

pub use backend::{count_rows, drain, Backend, BackendTransaction, RawIterator};
pub use config::{
    ClientOptions, MetadataSource, StaticMetadata, StaticTokenSource, TokenSource,
    DATASTORE_SCOPE, PROJECT_ID_ENV,
};
pub use engine::{
    cursor_position, position_cursor, Engine, EngineTransaction, PendingWrite, QueryRow,
    QueryRows, TransactionState,
};
pub use error::{EngineError, EngineResult};
pub use registry::{open_backend, register_factory, registered_backend, BackendFactory};
