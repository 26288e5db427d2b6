//! # dsclient middleware
//!
//! Stock middlewares for the dsclient chain.
//!
//! - [`NoopMiddleware`]: forwards everything unchanged
//! - [`LoggingMiddleware`]: numbered before/after lines per operation
//! - [`RetryMiddleware`]: bounded retries with exponential backoff
//! - [`ChaosMiddleware`]: seeded random failure injection
//! - [`SplitMiddleware`]: caps the number of keys per downstream call
//! - [`CacheMiddleware`]: read-through/write-through cache over a [`CacheStorage`]
//! - [`LocalCache`]: in-process [`CacheStorage`]
//! - [`FishboneMiddleware`]: turns entity queries into keys-only queries plus lookups
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dsclient_middleware::{CacheMiddleware, LocalCache, LocalCacheConfig, RetryMiddleware};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(LocalCache::new(LocalCacheConfig::default()));
//! client.append_middleware(Arc::new(RetryMiddleware::default()));
//! client.append_middleware(Arc::new(CacheMiddleware::new(cache)));
//! ```
//!
//! The first appended middleware is the outermost one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chaos;
mod fishbone;
mod localcache;
mod logging;
mod noop;
mod retry;
mod split;
mod storagecache;

pub use chaos::{ChaosConfig, ChaosMiddleware};
pub use fishbone::FishboneMiddleware;
pub use localcache::{LocalCache, LocalCacheConfig};
pub use logging::{LogSink, LoggingConfig, LoggingMiddleware};
pub use noop::NoopMiddleware;
pub use retry::{RetryConfig, RetryMiddleware, RetryPredicate};
pub use split::{SplitConfig, SplitMiddleware};
pub use storagecache::{CacheError, CacheItem, CacheMiddleware, CacheOptions, CacheResult, CacheStorage, KeyFilter};
