//! # dsclient core
//!
//! Client facade for the dsclient datastore client.
//!
//! This crate provides:
//! - [`Client`], the application-facing surface
//! - The middleware chain ([`Middleware`], [`MiddlewareInfo`], [`Next`])
//! - [`Transaction`] with commit/rollback notifications for middlewares
//! - [`QueryIterator`], stepping through the chain row by row
//! - The batch coordinator ([`Batch`], [`TransactionBatch`])
//!
//! Backends come from `dsclient_storage`; a client is opened either over an
//! explicit backend ([`Client::new`]) or over the registered one
//! ([`Client::from_context`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod client;
mod iterator;
mod middleware;
mod transaction;

pub use batch::{Batch, TransactionBatch};
pub use client::Client;
pub use iterator::QueryIterator;
pub use middleware::{Middleware, MiddlewareInfo, Next};
pub use transaction::{Transaction, TransactionState};

pub use dsclient_codec::{
    Commit, Context, Cursor, DsError, DsResult, Key, MultiError, PendingKey, PropertyList,
    PropertyLoadSaver, Query,
};
pub use dsclient_storage::{Backend, ClientOptions};
