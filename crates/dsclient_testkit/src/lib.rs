//! # dsclient testkit
//!
//! Test utilities for dsclient.
//!
//! This crate provides:
//! - Client fixtures over the embedded and the loopback cloud backend
//! - A recording middleware for asserting chain traffic
//! - A flaky middleware failing a configured number of calls
//! - Sample record types
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dsclient_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_client() {
//!     with_test_client(|tc| {
//!         tc.put(&tc.ctx, &data_key(1), &Data::named("one")).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod flaky;
pub mod generators;
pub mod recorder;
pub mod records;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::flaky::*;
    pub use crate::generators::*;
    pub use crate::recorder::*;
    pub use crate::records::*;
}

pub use fixtures::*;
pub use flaky::*;
pub use generators::*;
pub use recorder::*;
pub use records::*;
