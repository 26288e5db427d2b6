//! # dsclient codec
//!
//! Leaf data model and entity codec for the dsclient datastore client.
//!
//! This crate provides:
//! - [`Key`], [`Cursor`], [`PendingKey`] and [`Commit`] value types
//! - [`Value`], [`Property`], [`PropertyList`] and [`Entity`], the wire-shaped model
//! - [`Query`] and its canonical [`QueryDump`] fingerprint
//! - The error taxonomy ([`DsError`], [`MultiError`])
//! - The ambient [`Context`] threaded through every operation
//! - The entity codec mapping application records to property lists
//!
//! ## Records
//!
//! A record describes its fields once; the codec validates and caches the
//! description per type:
//!
//! ```rust,ignore
//! use dsclient_codec::{Record, Schema};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct User {
//!     name: String,
//!     tags: Vec<String>,
//! }
//!
//! impl Record for User {
//!     fn describe(schema: &mut Schema<Self>) {
//!         schema
//!             .field("Name", "", |r| &r.name, |r| &mut r.name)
//!             .field("Tags", ",noindex", |r| &r.tags, |r| &mut r.tags);
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod cursor;
pub mod entity;
mod error;
mod key;
mod property;
mod query;
mod transaction;
mod value;

pub use context::{CancelHandle, Context};
pub use cursor::Cursor;
pub use entity::{
    load_entity, load_struct, save_entity, save_struct, set_suppress_field_mismatch,
    suppress_field_mismatch, FieldMismatchPolicy, FieldType, PropertyLoadSaver,
    PropertyTranslator, Record, ScalarField, Schema,
};
pub use error::{DsError, DsResult, ErrorCode, FieldMismatch, MultiError};
pub use key::Key;
pub use property::{Entity, Property, PropertyList};
pub use query::{Direction, Filter, FilterDump, FilterOp, Order, Query, QueryDump};
pub use transaction::{Commit, PendingKey, TransactionId};
pub use value::{GeoPoint, Value};

/// Name of the pseudo-property addressing an entity's key in filters and orders.
pub const KEY_PROPERTY: &str = "__key__";
