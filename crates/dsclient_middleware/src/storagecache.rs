//! Read-through/write-through caching over a pluggable storage.
//!
//! Outside transactions the cache is consulted and refreshed directly. Inside a
//! transaction nothing is cached: writes are recorded per transaction and the
//! recorded keys are evicted once the commit succeeded. A rollback discards
//! the record.

use dsclient_codec::{Commit, Context, DsResult, Key, MultiError, PendingKey, PropertyList, TransactionId};
use dsclient_core::{Middleware, MiddlewareInfo, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by a [`CacheStorage`].
///
/// The cache middleware never surfaces these to callers; it logs them and
/// falls back to the downstream chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The storage could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// An item could not be stored or read back.
    #[error("cache item error: {0}")]
    Item(String),
}

/// Result type for cache storage operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// A cached entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    /// The entity key.
    pub key: Key,
    /// The entity properties.
    pub properties: PropertyList,
}

impl CacheItem {
    /// Creates a cache item.
    #[must_use]
    pub fn new(key: Key, properties: PropertyList) -> Self {
        Self { key, properties }
    }
}

/// Storage behind a [`CacheMiddleware`].
pub trait CacheStorage: Send + Sync {
    /// Stores `items`, replacing existing entries.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn set_multi(&self, ctx: &Context, items: &[CacheItem]) -> CacheResult<()>;

    /// Looks up `keys`; the result is aligned with `keys`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn get_multi(&self, ctx: &Context, keys: &[Key]) -> CacheResult<Vec<Option<CacheItem>>>;

    /// Removes `keys`. Missing entries are ignored.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> CacheResult<()>;
}

impl<S: CacheStorage + ?Sized> CacheStorage for Arc<S> {
    fn set_multi(&self, ctx: &Context, items: &[CacheItem]) -> CacheResult<()> {
        (**self).set_multi(ctx, items)
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key]) -> CacheResult<Vec<Option<CacheItem>>> {
        (**self).get_multi(ctx, keys)
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> CacheResult<()> {
        (**self).delete_multi(ctx, keys)
    }
}

/// Decides whether a key may be cached; returning false bypasses the cache.
pub type KeyFilter = Arc<dyn Fn(&Context, &Key) -> bool + Send + Sync>;

/// Options for [`CacheMiddleware`].
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// Every filter must accept a key for it to be cached.
    pub filters: Vec<KeyFilter>,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl CacheOptions {
    /// Creates options that cache every key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key filter.
    #[must_use]
    pub fn filter(mut self, filter: KeyFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Never caches entities of `kind`.
    #[must_use]
    pub fn skip_kind(self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.filter(Arc::new(move |_, key: &Key| key.kind() != kind))
    }

    fn cacheable(&self, ctx: &Context, key: &Key) -> bool {
        !key.incomplete() && self.filters.iter().all(|filter| filter(ctx, key))
    }
}

#[derive(Debug)]
enum TxOp {
    Put(Vec<PendingKey>),
    Delete(Vec<Key>),
}

/// Caches entities in a [`CacheStorage`].
pub struct CacheMiddleware<S> {
    storage: S,
    options: CacheOptions,
    tx_ops: Mutex<HashMap<TransactionId, Vec<TxOp>>>,
}

impl<S> fmt::Debug for CacheMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMiddleware")
            .field("options", &self.options)
            .field("transactions", &self.tx_ops.lock().len())
            .finish_non_exhaustive()
    }
}

impl<S: CacheStorage> CacheMiddleware<S> {
    /// Creates a cache middleware over `storage` caching every key.
    pub fn new(storage: S) -> Self {
        Self::with_options(storage, CacheOptions::default())
    }

    /// Creates a cache middleware over `storage`.
    pub fn with_options(storage: S, options: CacheOptions) -> Self {
        Self {
            storage,
            options,
            tx_ops: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Number of transactions with recorded writes.
    pub fn pending_transactions(&self) -> usize {
        self.tx_ops.lock().len()
    }

    fn record(&self, tx: TransactionId, op: TxOp) {
        self.tx_ops.lock().entry(tx).or_default().push(op);
    }

    fn store(&self, ctx: &Context, items: Vec<CacheItem>) {
        if items.is_empty() {
            return;
        }
        if let Err(err) = self.storage.set_multi(ctx, &items) {
            warn!(error = %err, len = items.len(), "cache: set failed");
        }
    }

    fn evict(&self, ctx: &Context, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        if let Err(err) = self.storage.delete_multi(ctx, keys) {
            warn!(error = %err, len = keys.len(), "cache: delete failed");
        }
    }

    /// Looks up the cacheable keys, filling `dst` on hits. Returns the
    /// positions that must be fetched downstream.
    fn lookup(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> Vec<usize> {
        let cacheable: Vec<usize> = (0..keys.len())
            .filter(|&i| self.options.cacheable(ctx, &keys[i]))
            .collect();
        let mut hit = vec![false; keys.len()];
        if !cacheable.is_empty() {
            let lookup: Vec<Key> = cacheable.iter().map(|&i| keys[i].clone()).collect();
            match self.storage.get_multi(ctx, &lookup) {
                Ok(items) if items.len() == lookup.len() => {
                    for (&i, item) in cacheable.iter().zip(items) {
                        if let Some(item) = item {
                            dst[i] = item.properties;
                            hit[i] = true;
                        }
                    }
                }
                Ok(items) => warn!(
                    expected = lookup.len(),
                    got = items.len(),
                    "cache: misaligned lookup ignored"
                ),
                Err(err) => warn!(error = %err, "cache: get failed"),
            }
        }
        (0..keys.len()).filter(|&i| !hit[i]).collect()
    }
}

impl<S: CacheStorage> Middleware for CacheMiddleware<S> {
    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        let stored = match info.next.put_multi_without_tx(info, keys, entities) {
            Ok(stored) => stored,
            Err(err) => {
                // The write may still have landed; drop what the cache holds.
                let complete: Vec<Key> = keys.iter().filter(|key| !key.incomplete()).cloned().collect();
                self.evict(&info.context, &complete);
                return Err(err);
            }
        };
        let items = stored
            .iter()
            .zip(entities)
            .filter(|(key, _)| self.options.cacheable(&info.context, key))
            .map(|(key, props)| CacheItem::new(key.clone(), props.clone()))
            .collect();
        self.store(&info.context, items);
        Ok(stored)
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        let pending = info.next.put_multi_with_tx(info, keys, entities)?;
        if let Some(tx) = &info.transaction {
            self.record(tx.id(), TxOp::Put(pending.clone()));
        }
        Ok(pending)
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        if keys.len() != dst.len() {
            return info.next.get_multi_without_tx(info, keys, dst);
        }
        let misses = self.lookup(&info.context, keys, dst);
        debug!(hits = keys.len() - misses.len(), misses = misses.len(), "cache: lookup");
        if misses.is_empty() {
            return Ok(());
        }

        let miss_keys: Vec<Key> = misses.iter().map(|&i| keys[i].clone()).collect();
        let mut fetched = vec![PropertyList::new(); miss_keys.len()];
        let outcome = info.next.get_multi_without_tx(info, &miss_keys, &mut fetched);
        let miss_errs = MultiError::from_outcome(miss_keys.len(), &outcome);

        let mut errs = MultiError::new(keys.len());
        let mut items = Vec::new();
        for (j, (&i, props)) in misses.iter().zip(fetched).enumerate() {
            if let Some(err) = miss_errs.get(j) {
                errs.set(i, err.clone());
                continue;
            }
            if self.options.cacheable(&info.context, &keys[i]) {
                items.push(CacheItem::new(keys[i].clone(), props.clone()));
            }
            dst[i] = props;
        }
        self.store(&info.context, items);
        errs.into_result()
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        let result = info.next.delete_multi_without_tx(info, keys);
        self.evict(&info.context, keys);
        result
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        info.next.delete_multi_with_tx(info, keys)?;
        if let Some(tx) = &info.transaction {
            self.record(tx.id(), TxOp::Delete(keys.to_vec()));
        }
        Ok(())
    }

    fn post_commit(&self, info: &MiddlewareInfo, tx: &Transaction, commit: &Commit) -> DsResult<()> {
        let ops = self.tx_ops.lock().remove(&tx.id()).unwrap_or_default();
        let mut keys = Vec::new();
        for op in ops {
            match op {
                TxOp::Put(pending) => {
                    for p in &pending {
                        match commit.key(p) {
                            Ok(key) => keys.push(key),
                            Err(err) => warn!(error = %err, "cache: unresolved pending key"),
                        }
                    }
                }
                TxOp::Delete(deleted) => keys.extend(deleted),
            }
        }
        // The transaction context may already be done; evict under the
        // client's base context.
        let ctx = info.client.context().without_cancel();
        debug!(transaction = %tx.id(), len = keys.len(), "cache: evicting committed keys");
        self.evict(&ctx, &keys);
        info.next.post_commit(info, tx, commit)
    }

    fn post_rollback(&self, info: &MiddlewareInfo, tx: &Transaction) -> DsResult<()> {
        if self.tx_ops.lock().remove(&tx.id()).is_some() {
            debug!(transaction = %tx.id(), "cache: dropped recorded writes");
        }
        info.next.post_rollback(info, tx)
    }
}
