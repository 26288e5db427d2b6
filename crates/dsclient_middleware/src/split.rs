//! Capping the number of keys per downstream call.

use dsclient_codec::{DsResult, Key, MultiError, PendingKey, PropertyList};
use dsclient_core::{Middleware, MiddlewareInfo};
use std::ops::Range;
use tracing::trace;

/// Per-operation key limits for [`SplitMiddleware`]. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitConfig {
    /// Keys per downstream get.
    pub get: usize,

    /// Keys per downstream put.
    pub put: usize,

    /// Keys per downstream delete.
    pub delete: usize,
}

impl SplitConfig {
    /// Creates a configuration without limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the get limit.
    #[must_use]
    pub const fn get(mut self, limit: usize) -> Self {
        self.get = limit;
        self
    }

    /// Sets the put limit.
    #[must_use]
    pub const fn put(mut self, limit: usize) -> Self {
        self.put = limit;
        self
    }

    /// Sets the delete limit.
    #[must_use]
    pub const fn delete(mut self, limit: usize) -> Self {
        self.delete = limit;
        self
    }
}

/// Splits multi-key calls into consecutive chunks no larger than the
/// configured limits.
///
/// Chunks are forwarded one after the other in input order. Per-key errors of
/// every chunk are merged into one multi-error aligned with the full input; an
/// error that is not per-key is reported for every key of its chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitMiddleware {
    config: SplitConfig,
}

impl SplitMiddleware {
    /// Creates a split middleware.
    #[must_use]
    pub const fn new(config: SplitConfig) -> Self {
        Self { config }
    }
}

fn chunks(len: usize, limit: usize) -> impl Iterator<Item = Range<usize>> {
    let size = if limit == 0 { len.max(1) } else { limit };
    (0..len).step_by(size).map(move |start| start..(start + size).min(len))
}

fn needs_split(len: usize, limit: usize) -> bool {
    limit > 0 && len > limit
}

/// Merges `chunk`'s outcome into `errs` at `range`.
fn record(errs: &mut MultiError, range: &Range<usize>, outcome: &DsResult<()>) {
    let chunk = MultiError::from_outcome(range.len(), outcome);
    for (offset, err) in chunk.into_inner().into_iter().enumerate() {
        if let Some(err) = err {
            errs.set(range.start + offset, err);
        }
    }
}

fn split_puts<T>(
    keys: &[Key],
    entities: &[PropertyList],
    limit: usize,
    mut put: impl FnMut(&[Key], &[PropertyList]) -> DsResult<Vec<T>>,
) -> DsResult<Vec<T>> {
    let mut stored = Vec::new();
    let mut errs = MultiError::new(keys.len());
    for range in chunks(keys.len(), limit) {
        trace!(start = range.start, len = range.len(), "split: put chunk");
        let outcome = put(&keys[range.clone()], &entities[range.clone()]).map(|done| stored.push(done));
        record(&mut errs, &range, &outcome);
    }
    errs.into_result()?;
    // Only reached when every chunk succeeded, so the keys line up with the input.
    Ok(stored.into_iter().flatten().collect())
}

fn split_gets(
    keys: &[Key],
    dst: &mut [PropertyList],
    limit: usize,
    mut get: impl FnMut(&[Key], &mut [PropertyList]) -> DsResult<()>,
) -> DsResult<()> {
    let mut errs = MultiError::new(keys.len());
    for range in chunks(keys.len(), limit) {
        trace!(start = range.start, len = range.len(), "split: get chunk");
        let outcome = get(&keys[range.clone()], &mut dst[range.clone()]);
        record(&mut errs, &range, &outcome);
    }
    errs.into_result()
}

fn split_deletes(keys: &[Key], limit: usize, mut delete: impl FnMut(&[Key]) -> DsResult<()>) -> DsResult<()> {
    let mut errs = MultiError::new(keys.len());
    for range in chunks(keys.len(), limit) {
        trace!(start = range.start, len = range.len(), "split: delete chunk");
        let outcome = delete(&keys[range.clone()]);
        record(&mut errs, &range, &outcome);
    }
    errs.into_result()
}

impl Middleware for SplitMiddleware {
    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        if !needs_split(keys.len(), self.config.put) || keys.len() != entities.len() {
            return info.next.put_multi_without_tx(info, keys, entities);
        }
        split_puts(keys, entities, self.config.put, |k, e| {
            info.next.put_multi_without_tx(info, k, e)
        })
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        if !needs_split(keys.len(), self.config.put) || keys.len() != entities.len() {
            return info.next.put_multi_with_tx(info, keys, entities);
        }
        split_puts(keys, entities, self.config.put, |k, e| info.next.put_multi_with_tx(info, k, e))
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        if !needs_split(keys.len(), self.config.get) || keys.len() != dst.len() {
            return info.next.get_multi_without_tx(info, keys, dst);
        }
        split_gets(keys, dst, self.config.get, |k, d| info.next.get_multi_without_tx(info, k, d))
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        if !needs_split(keys.len(), self.config.get) || keys.len() != dst.len() {
            return info.next.get_multi_with_tx(info, keys, dst);
        }
        split_gets(keys, dst, self.config.get, |k, d| info.next.get_multi_with_tx(info, k, d))
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        if !needs_split(keys.len(), self.config.delete) {
            return info.next.delete_multi_without_tx(info, keys);
        }
        split_deletes(keys, self.config.delete, |k| info.next.delete_multi_without_tx(info, k))
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        if !needs_split(keys.len(), self.config.delete) {
            return info.next.delete_multi_with_tx(info, keys);
        }
        split_deletes(keys, self.config.delete, |k| info.next.delete_multi_with_tx(info, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::DsError;

    #[test]
    fn chunks_cover_the_input_in_order() {
        let ranges: Vec<_> = chunks(5, 2).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);
        assert_eq!(chunks(3, 0).collect::<Vec<_>>(), vec![0..3]);
        assert_eq!(chunks(0, 2).count(), 0);
    }

    #[test]
    fn chunk_errors_land_at_their_input_positions() {
        let keys: Vec<Key> = (1..=5).map(|id| Key::id_key("Data", id, None)).collect();
        let err = split_deletes(&keys, 2, |chunk| {
            if chunk[0].id() == 3 {
                let mut errs = MultiError::new(chunk.len());
                errs.set(1, DsError::InvalidKey);
                Err(DsError::Multi(errs))
            } else if chunk[0].id() == 5 {
                Err(DsError::Canceled)
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        let DsError::Multi(errs) = err else {
            panic!("expected a multi error, got {err:?}");
        };
        assert_eq!(errs.len(), 5);
        assert_eq!(errs.get(0), None);
        assert_eq!(errs.get(3), Some(&DsError::InvalidKey));
        assert_eq!(errs.get(4), Some(&DsError::Canceled));
        assert_eq!(errs.error_count(), 2);
    }

    #[test]
    fn put_chunks_concatenate_in_input_order() {
        let keys: Vec<Key> = (1..=5).map(|id| Key::id_key("Data", id, None)).collect();
        let entities = vec![PropertyList::new(); keys.len()];
        let stored = split_puts(&keys, &entities, 2, |chunk, _| Ok(chunk.to_vec())).unwrap();
        assert_eq!(stored, keys);
    }

    #[test]
    fn a_failed_put_chunk_returns_no_keys() {
        let keys: Vec<Key> = (1..=4).map(|id| Key::id_key("Data", id, None)).collect();
        let entities = vec![PropertyList::new(); keys.len()];
        let err = split_puts(&keys, &entities, 2, |chunk, _| {
            if chunk[0].id() == 3 {
                Err(DsError::Canceled)
            } else {
                Ok(chunk.to_vec())
            }
        })
        .unwrap_err();

        let DsError::Multi(errs) = err else {
            panic!("expected a multi error, got {err:?}");
        };
        assert_eq!(errs.len(), 4);
        assert_eq!(errs.get(1), None);
        assert_eq!(errs.get(2), Some(&DsError::Canceled));
        assert_eq!(errs.get(3), Some(&DsError::Canceled));
    }
}
