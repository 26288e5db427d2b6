//! Random failure injection.

use dsclient_codec::{DsError, DsResult, ErrorCode, Key, PendingKey, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo};
use dsclient_storage::RawIterator;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Configuration for [`ChaosMiddleware`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosConfig {
    /// Seed of the failure sequence.
    pub seed: u64,

    /// Probability, between 0 and 1, that a call fails.
    pub error_rate: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            error_rate: 0.1,
        }
    }
}

impl ChaosConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the failure probability.
    #[must_use]
    pub const fn error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate;
        self
    }
}

/// Fails calls at random with an `Unavailable` backend error, before they are
/// forwarded.
///
/// The failure sequence is fully determined by the seed. Iterator steps and
/// the transaction hooks are never failed.
#[derive(Debug)]
pub struct ChaosMiddleware {
    rate: f64,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl ChaosMiddleware {
    /// Creates a chaos middleware.
    #[must_use]
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            rate: config.error_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn roll(&self, op: &str) -> DsResult<()> {
        if !self.rng.lock().gen_bool(self.rate) {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::Relaxed);
        debug!(op, "chaos: injecting failure");
        Err(DsError::backend(ErrorCode::Unavailable, format!("chaos: {op} failed")))
    }
}

impl Middleware for ChaosMiddleware {
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        self.roll("AllocateIDs")?;
        info.next.allocate_ids(info, keys)
    }

    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        self.roll("PutMultiWithoutTx")?;
        info.next.put_multi_without_tx(info, keys, entities)
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        self.roll("PutMultiWithTx")?;
        info.next.put_multi_with_tx(info, keys, entities)
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        self.roll("GetMultiWithoutTx")?;
        info.next.get_multi_without_tx(info, keys, dst)
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.roll("GetMultiWithTx")?;
        info.next.get_multi_with_tx(info, keys, dst)
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.roll("DeleteMultiWithoutTx")?;
        info.next.delete_multi_without_tx(info, keys)
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.roll("DeleteMultiWithTx")?;
        info.next.delete_multi_with_tx(info, keys)
    }

    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        self.roll("Run")?;
        info.next.run(info, query)
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        self.roll("GetAll")?;
        info.next.get_all(info, query, dst)
    }

    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        self.roll("Count")?;
        info.next.count(info, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(middleware: &ChaosMiddleware, n: usize) -> Vec<bool> {
        (0..n).map(|_| middleware.roll("Op").is_err()).collect()
    }

    #[test]
    fn same_seed_same_failures() {
        let config = ChaosConfig::new().seed(42).error_rate(0.5);
        let a = outcomes(&ChaosMiddleware::new(config), 64);
        let b = outcomes(&ChaosMiddleware::new(config), 64);
        assert_eq!(a, b);
        assert!(a.iter().any(|&failed| failed));
        assert!(a.iter().any(|&failed| !failed));
    }

    #[test]
    fn extreme_rates() {
        let never = ChaosMiddleware::new(ChaosConfig::new().error_rate(0.0));
        assert!(outcomes(&never, 32).iter().all(|&failed| !failed));

        let always = ChaosMiddleware::new(ChaosConfig::new().error_rate(7.0));
        assert!(outcomes(&always, 32).iter().all(|&failed| failed));
        assert_eq!(always.injected(), 32);
    }

    #[test]
    fn injected_errors_are_retriable() {
        let always = ChaosMiddleware::new(ChaosConfig::new().error_rate(1.0));
        assert!(always.roll("Op").unwrap_err().is_retriable());
    }
}
