//! End-to-end scenarios combining the stock middlewares with both backends.

use dsclient_codec::{DsError, Key};
use dsclient_middleware::{
    CacheMiddleware, CacheStorage, LocalCache, LocalCacheConfig, SplitConfig, SplitMiddleware,
};
use dsclient_testkit::prelude::*;
use std::sync::Arc;

fn with_cache(tc: &TestClient) -> Arc<LocalCache> {
    let cache = Arc::new(LocalCache::new(LocalCacheConfig::default()));
    tc.append_middleware(Arc::new(CacheMiddleware::new(Arc::clone(&cache))));
    cache
}

#[test]
fn test_partial_cache_miss_with_backend_gaps() {
    with_each_backend(|tc| {
        let cache = with_cache(tc);
        let keys = seed_data(tc, &tc.ctx, 1..=10).unwrap();
        assert_eq!(cache.len(), 10);

        let evicted: Vec<Key> = [2, 4, 6, 8, 10].into_iter().map(data_key).collect();
        cache.delete_multi(&tc.ctx, &evicted).unwrap();
        let removed: Vec<Key> = [3, 6, 9].into_iter().map(data_key).collect();
        tc.delete_multi(&tc.ctx, &removed).unwrap();

        let mut loaded = vec![Data::default(); 10];
        let err = tc.get_multi(&tc.ctx, &keys, &mut loaded).unwrap_err();
        let DsError::Multi(errs) = err else {
            panic!("expected a multi error, got {err:?}");
        };
        assert_eq!(errs.len(), 10);
        for (i, data) in loaded.iter().enumerate() {
            let id = i as i64 + 1;
            if id % 3 == 0 {
                assert_eq!(errs.get(i), Some(&DsError::NoSuchEntity), "id {id}");
            } else {
                assert_eq!(errs.get(i), None, "id {id}");
                assert_eq!(data, &Data::named(format!("#{id}")));
            }
        }
    });
}

#[test]
fn test_transaction_rollback_preserves_cache() {
    with_each_backend(|tc| {
        let cache = with_cache(tc);
        let recorder = Recorder::new();
        tc.append_middleware(recorder.middleware("below"));
        let a = tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();
        assert_eq!(cache.keys(), vec![a.clone()]);

        let tx = tc.new_transaction(&tc.ctx).unwrap();
        tx.put(&tc.incomplete_key("Data", None), &Data::named("b")).unwrap();
        let mut loaded = Data::default();
        tx.get(&a, &mut loaded).unwrap();
        tx.delete(&a).unwrap();
        tx.rollback().unwrap();

        assert_eq!(cache.keys(), vec![a.clone()]);
        assert_eq!(recorder.calls("below", "PostCommit"), 0);
        assert_eq!(recorder.calls("below", "PostRollback"), 1);
        assert_eq!(recorder.calls("below", "GetMultiWithTx"), 1);
    });
}

#[test]
fn test_transaction_commit_invalidates_cache() {
    with_each_backend(|tc| {
        let cache = with_cache(tc);
        let a = tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();
        assert!(cache.has(&a));

        let tx = tc.new_transaction(&tc.ctx).unwrap();
        let pending = tx.put(&tc.incomplete_key("Data", None), &Data::named("b")).unwrap();
        let mut loaded = Data::default();
        tx.get(&a, &mut loaded).unwrap();
        assert_eq!(loaded, Data::named("a"));
        tx.delete(&a).unwrap();
        assert!(cache.has(&a), "uncommitted delete reached the cache");

        let commit = tx.commit().unwrap();
        let resolved = commit.key(&pending).unwrap();
        assert!(!resolved.incomplete());
        assert!(!cache.has(&a));
        assert!(!cache.has(&resolved));
        assert!(cache.is_empty());

        let mut fetched = Data::default();
        tc.get(&tc.ctx, &resolved, &mut fetched).unwrap();
        assert_eq!(fetched, Data::named("b"));
        assert_eq!(tc.get(&tc.ctx, &a, &mut fetched), Err(DsError::NoSuchEntity));
    });
}

#[test]
fn test_failed_commit_drops_recorded_writes() {
    let tc = TestClient::embedded();
    let cache_storage = Arc::new(LocalCache::new(LocalCacheConfig::default()));
    let cache = Arc::new(CacheMiddleware::new(Arc::clone(&cache_storage)));
    tc.append_middleware(cache.clone());
    let a = tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();

    let tx = tc.new_transaction(&tc.ctx).unwrap();
    let mut loaded = Data::default();
    tx.get(&a, &mut loaded).unwrap();
    tx.put(&a, &Data::named("from tx")).unwrap();
    tc.put(&tc.ctx, &a, &Data::named("concurrent")).unwrap();

    assert_eq!(tx.commit().unwrap_err(), DsError::ConcurrentTransaction);
    assert_eq!(cache.pending_transactions(), 0);
    tc.get(&tc.ctx, &a, &mut loaded).unwrap();
    assert_eq!(loaded, Data::named("concurrent"));
}

#[test]
fn test_request_splitting() {
    with_each_backend(|tc| {
        let recorder = Recorder::new();
        tc.append_middleware(Arc::new(SplitMiddleware::new(SplitConfig::new().get(3).put(2))));
        tc.append_middleware(recorder.middleware("below"));

        let keys = seed_data(tc, &tc.ctx, 1..=5).unwrap();
        assert_eq!(recorder.lengths("below", "PutMultiWithoutTx"), vec![2, 2, 1]);

        let mut loaded = vec![Data::default(); 5];
        tc.get_multi(&tc.ctx, &keys, &mut loaded).unwrap();
        assert_eq!(recorder.lengths("below", "GetMultiWithoutTx"), vec![3, 2]);
        assert_eq!(loaded[4], Data::named("#5"));
    });
}

#[test]
fn test_split_errors_stay_aligned() {
    let tc = TestClient::embedded();
    tc.append_middleware(Arc::new(SplitMiddleware::new(SplitConfig::new().get(2))));
    let keys = seed_data(&tc, &tc.ctx, 1..=5).unwrap();
    tc.delete(&tc.ctx, &keys[3]).unwrap();

    let mut loaded = vec![Data::default(); 5];
    let DsError::Multi(errs) = tc.get_multi(&tc.ctx, &keys, &mut loaded).unwrap_err() else {
        panic!("expected a multi error");
    };
    assert_eq!(errs.len(), 5);
    assert_eq!(errs.get(3), Some(&DsError::NoSuchEntity));
    assert_eq!(errs.error_count(), 1);
    assert_eq!(loaded[4], Data::named("#5"));
}

#[test]
fn test_split_applies_inside_transactions() {
    let tc = TestClient::embedded();
    let recorder = Recorder::new();
    tc.append_middleware(Arc::new(SplitMiddleware::new(SplitConfig::new().put(2).delete(1))));
    tc.append_middleware(recorder.middleware("below"));

    let tx = tc.new_transaction(&tc.ctx).unwrap();
    let keys: Vec<Key> = (1..=3).map(|_| tc.incomplete_key("Data", None)).collect();
    let values = vec![Data::named("x"); 3];
    let pending = tx.put_multi(&keys, &values).unwrap();
    tx.delete_multi(&[data_key(7), data_key(8)]).unwrap();
    let commit = tx.commit().unwrap();

    assert_eq!(recorder.lengths("below", "PutMultiWithTx"), vec![2, 1]);
    assert_eq!(recorder.lengths("below", "DeleteMultiWithTx"), vec![1, 1]);
    for p in &pending {
        assert!(!commit.key(p).unwrap().incomplete());
    }
}

#[test]
fn test_batch_goes_through_the_chain() {
    let tc = TestClient::embedded();
    let recorder = Recorder::new();
    tc.append_middleware(Arc::new(SplitMiddleware::new(SplitConfig::new().put(2))));
    tc.append_middleware(recorder.middleware("below"));

    let batch = tc.batch();
    let replies: Vec<_> = (1..=5)
        .map(|id| batch.put(data_key(id), Data::named(format!("#{id}"))))
        .collect();
    batch.exec(&tc.ctx).unwrap();

    assert_eq!(recorder.lengths("below", "PutMultiWithoutTx"), vec![2, 2, 1]);
    for (id, reply) in (1..=5).zip(replies) {
        assert_eq!(reply.recv().unwrap().unwrap(), data_key(id));
    }
}
