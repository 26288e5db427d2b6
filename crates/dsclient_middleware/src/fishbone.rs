//! Replacing entity queries with keys-only queries plus lookups.
//!
//! Keys-only queries are cheap, and fetching the entities by key lets a cache
//! further down the chain serve them.

use dsclient_codec::{DsError, DsResult, Key, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo};
use dsclient_storage::RawIterator;
use tracing::trace;

/// Runs entity queries as keys-only queries and loads the rows with
/// `GetMultiWithoutTx`.
///
/// Only plain entity queries outside transactions are rewritten; keys-only
/// and projection queries, and every query inside a transaction, pass through.
/// Entities deleted between the query and the lookup are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FishboneMiddleware;

impl FishboneMiddleware {
    /// Creates the middleware.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn rewrite(info: &MiddlewareInfo, query: &Query) -> Option<Query> {
    if info.transaction.is_some() || query.is_keys_only() || !query.projection().is_empty() {
        return None;
    }
    Some(query.clone().keys_only())
}

impl Middleware for FishboneMiddleware {
    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        match rewrite(info, query) {
            Some(keys_only) => info.next.run(info, &keys_only),
            None => info.next.run(info, query),
        }
    }

    fn next(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        iter: &mut dyn RawIterator,
        dst: &mut PropertyList,
    ) -> DsResult<Key> {
        let Some(keys_only) = rewrite(info, query) else {
            return info.next.next(info, query, iter, dst);
        };
        loop {
            let mut scratch = PropertyList::new();
            let key = info.next.next(info, &keys_only, iter, &mut scratch)?;
            let mut row = [PropertyList::new()];
            match info
                .next
                .get_multi_without_tx(info, std::slice::from_ref(&key), &mut row)
                .map_err(DsError::unwrap_single)
            {
                Ok(()) => {
                    let [props] = row;
                    *dst = props;
                    return Ok(key);
                }
                Err(DsError::NoSuchEntity) => trace!(%key, "fishbone: skipping deleted row"),
                Err(err) => return Err(err),
            }
        }
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        let Some(keys_only) = rewrite(info, query) else {
            return info.next.get_all(info, query, dst);
        };
        let keys = info.next.get_all(info, &keys_only, &mut Vec::new())?;
        if keys.is_empty() {
            return Ok(keys);
        }
        let mut rows = vec![PropertyList::new(); keys.len()];
        let errs = match info.next.get_multi_without_tx(info, &keys, &mut rows) {
            Ok(()) => None,
            Err(DsError::Multi(errs)) if errs.len() == keys.len() => Some(errs),
            Err(err) => return Err(err),
        };
        let mut found = Vec::with_capacity(keys.len());
        for (i, (key, props)) in keys.into_iter().zip(rows).enumerate() {
            match errs.as_ref().and_then(|errs| errs.get(i)) {
                None => {
                    found.push(key);
                    dst.push(props);
                }
                Some(DsError::NoSuchEntity) => trace!(%key, "fishbone: dropping deleted row"),
                Some(err) => return Err(err.clone()),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_testkit::{seed_data, Data, Recorder, TestClient};
    use std::sync::Arc;

    fn fishbone_client() -> (TestClient, Recorder, Vec<Key>) {
        let tc = TestClient::embedded();
        let keys = seed_data(&tc, &tc.ctx, 1..=4).unwrap();
        let recorder = Recorder::new();
        tc.append_middleware(Arc::new(FishboneMiddleware::new()));
        tc.append_middleware(recorder.middleware("below"));
        (tc, recorder, keys)
    }

    #[test]
    fn iteration_loads_rows_by_key() {
        let (tc, recorder, keys) = fishbone_client();
        let mut iter = tc.run(&tc.ctx, &tc.new_query("Data")).unwrap();
        let mut seen = Vec::new();
        let mut row = Data::default();
        while let Ok(key) = iter.next(&mut row) {
            seen.push((key, row.clone()));
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (keys[0].clone(), Data::named("#1")));
        assert_eq!(recorder.lengths("below", "GetMultiWithoutTx"), vec![1; 4]);
    }

    #[test]
    fn rows_deleted_after_the_query_are_skipped() {
        let (tc, _, keys) = fishbone_client();
        let mut iter = tc.run(&tc.ctx, &tc.new_query("Data")).unwrap();
        tc.engine.delete(&keys[1..2]).unwrap();

        let mut row = Data::default();
        let mut seen = Vec::new();
        while let Ok(key) = iter.next(&mut row) {
            seen.push(key);
        }
        assert_eq!(seen, vec![keys[0].clone(), keys[2].clone(), keys[3].clone()]);
    }

    #[test]
    fn get_all_uses_one_lookup() {
        let (tc, recorder, keys) = fishbone_client();
        let mut rows: Vec<Data> = Vec::new();
        let found = tc.get_all(&tc.ctx, &tc.new_query("Data"), &mut rows).unwrap();
        assert_eq!(found, keys);
        assert_eq!(rows[3], Data::named("#4"));
        assert_eq!(recorder.lengths("below", "GetMultiWithoutTx"), vec![4]);
    }

    #[test]
    fn keys_only_queries_pass_through() {
        let (tc, recorder, keys) = fishbone_client();
        let mut rows: Vec<Data> = Vec::new();
        let found = tc
            .get_all(&tc.ctx, &tc.new_query("Data").keys_only(), &mut rows)
            .unwrap();
        assert_eq!(found, keys);
        assert_eq!(recorder.calls("below", "GetMultiWithoutTx"), 0);
    }
}
