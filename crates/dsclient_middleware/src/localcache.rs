//! In-process cache storage.

use crate::storagecache::{CacheItem, CacheResult, CacheStorage};
use dsclient_codec::{Context, Key};
use moka::sync::Cache;
use std::time::Duration;

/// Configuration for [`LocalCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCacheConfig {
    /// How long an entry stays valid. `None` keeps entries until evicted.
    pub expiration: Option<Duration>,

    /// Maximum number of entries. Zero means unbounded.
    pub max_entries: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            expiration: None,
            max_entries: 10_000,
        }
    }
}

impl LocalCacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry lifetime.
    #[must_use]
    pub const fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the entry limit.
    #[must_use]
    pub const fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// A [`CacheStorage`] held in process memory, keyed by encoded key.
///
/// Capacity and expiry are enforced by a [`moka`] cache; which entry goes
/// when the cache is full is up to its admission policy.
#[derive(Debug)]
pub struct LocalCache {
    config: LocalCacheConfig,
    entries: Cache<String, CacheItem>,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(LocalCacheConfig::default())
    }
}

impl LocalCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: LocalCacheConfig) -> Self {
        let mut builder = Cache::<String, CacheItem>::builder();
        if config.max_entries > 0 {
            builder = builder.max_capacity(config.max_entries);
        }
        if let Some(ttl) = config.expiration {
            builder = builder.time_to_live(ttl);
        }
        Self {
            config,
            entries: builder.build(),
        }
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &LocalCacheConfig {
        &self.config
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.iter().count()
    }

    /// Returns true when no live entry is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when `key` has a live entry.
    pub fn has(&self, key: &Key) -> bool {
        self.entries.contains_key(&key.encode())
    }

    /// Keys of the live entries, ordered by their encoded form.
    pub fn keys(&self) -> Vec<Key> {
        self.entries.run_pending_tasks();
        let mut live: Vec<(String, Key)> = self
            .entries
            .iter()
            .map(|(encoded, item)| (encoded.as_ref().clone(), item.key))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live.into_iter().map(|(_, key)| key).collect()
    }

    /// Removes every entry.
    pub fn flush(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

impl CacheStorage for LocalCache {
    fn set_multi(&self, _ctx: &Context, items: &[CacheItem]) -> CacheResult<()> {
        for item in items {
            self.entries.insert(item.key.encode(), item.clone());
        }
        Ok(())
    }

    fn get_multi(&self, _ctx: &Context, keys: &[Key]) -> CacheResult<Vec<Option<CacheItem>>> {
        Ok(keys.iter().map(|key| self.entries.get(&key.encode())).collect())
    }

    fn delete_multi(&self, _ctx: &Context, keys: &[Key]) -> CacheResult<()> {
        for key in keys {
            self.entries.invalidate(&key.encode());
        }
        Ok(())
    }
}
