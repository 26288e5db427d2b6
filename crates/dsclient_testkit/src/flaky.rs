//! A middleware that fails a configured number of calls.

use dsclient_codec::{DsError, DsResult, ErrorCode, Key, PendingKey, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails the first `failures` data calls with a fixed error, then forwards.
///
/// Post-commit and post-rollback hooks and iterator steps are never failed.
#[derive(Debug)]
pub struct FlakyMiddleware {
    failures: usize,
    error: DsError,
    calls: AtomicUsize,
}

impl FlakyMiddleware {
    /// Fails the first `failures` calls with an `Unavailable` backend error.
    pub fn new(failures: usize) -> Self {
        Self::with_error(failures, DsError::backend(ErrorCode::Unavailable, "flaky backend"))
    }

    /// Fails the first `failures` calls with `error`.
    pub fn with_error(failures: usize, error: DsError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls seen so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> DsResult<()> {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        if seen < self.failures {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

impl Middleware for FlakyMiddleware {
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        self.check()?;
        info.next.allocate_ids(info, keys)
    }

    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        self.check()?;
        info.next.put_multi_without_tx(info, keys, entities)
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        self.check()?;
        info.next.put_multi_with_tx(info, keys, entities)
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        self.check()?;
        info.next.get_multi_without_tx(info, keys, dst)
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.check()?;
        info.next.get_multi_with_tx(info, keys, dst)
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.check()?;
        info.next.delete_multi_without_tx(info, keys)
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.check()?;
        info.next.delete_multi_with_tx(info, keys)
    }

    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn dsclient_storage::RawIterator>> {
        self.check()?;
        info.next.run(info, query)
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        self.check()?;
        info.next.get_all(info, query, dst)
    }

    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        self.check()?;
        info.next.count(info, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestClient;
    use crate::records::{data_key, Data};
    use std::sync::Arc;

    #[test]
    fn fails_then_recovers() {
        let tc = TestClient::embedded();
        let flaky = Arc::new(FlakyMiddleware::new(2));
        tc.append_middleware(flaky.clone());

        for _ in 0..2 {
            let err = tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap_err();
            assert!(err.is_retriable());
        }
        tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();
        assert_eq!(flaky.calls(), 3);
    }
}
