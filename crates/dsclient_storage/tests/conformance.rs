//! Behaviour both adapters must share.

use dsclient_codec::{Context, DsError, Key, PropertyList, Query, Value};
use dsclient_storage::cloud::{CloudBackend, CloudIterator, LoopbackService};
use dsclient_storage::embedded::EmbeddedBackend;
use dsclient_storage::{Backend, ClientOptions, Engine, StaticTokenSource};
use std::sync::Arc;

fn embedded() -> Arc<dyn Backend> {
    Arc::new(EmbeddedBackend::new(Arc::new(Engine::new())))
}

fn cloud() -> Arc<dyn Backend> {
    let service = LoopbackService::new(Arc::new(Engine::new()))
        .with_lookup_limit(2)
        .with_page_limit(3);
    Arc::new(CloudBackend::with_options(
        "test-project",
        Arc::new(service),
        &ClientOptions::new().query_batch_size(2),
    ))
}

fn backends() -> Vec<Arc<dyn Backend>> {
    vec![embedded(), cloud()]
}

fn named(name: &str) -> PropertyList {
    let mut props = PropertyList::new();
    props.push_value("Name", name, false);
    props
}

fn seed(backend: &dyn Backend, ctx: &Context, count: i64) -> Vec<Key> {
    let keys: Vec<Key> = (1..=count).map(|id| Key::id_key("Data", id, None)).collect();
    let entities: Vec<PropertyList> = (1..=count).map(|id| named(&format!("#{id}"))).collect();
    backend.put_multi(ctx, &keys, &entities).unwrap()
}

#[test]
fn get_multi_aligns_errors_with_keys() {
    let ctx = Context::background();
    for backend in backends() {
        let keys = seed(backend.as_ref(), &ctx, 10);
        backend
            .delete_multi(&ctx, &[keys[2].clone(), keys[5].clone(), keys[8].clone()])
            .unwrap();

        let mut dst = vec![PropertyList::new(); 10];
        let err = backend.get_multi(&ctx, &keys, &mut dst).unwrap_err();
        let DsError::Multi(errs) = err else {
            panic!("{}: expected multi error", backend.name());
        };
        assert_eq!(errs.len(), 10, "{}", backend.name());
        for (i, entry) in errs.iter().enumerate() {
            let id = i as i64 + 1;
            if id % 3 == 0 {
                assert_eq!(entry.as_ref(), Some(&DsError::NoSuchEntity));
            } else {
                assert!(entry.is_none(), "{}: index {i}", backend.name());
                assert_eq!(dst[i], named(&format!("#{id}")));
            }
        }
    }
}

#[test]
fn duplicate_keys_are_all_answered() {
    let ctx = Context::background();
    for backend in backends() {
        let keys = seed(backend.as_ref(), &ctx, 1);
        let twice = vec![keys[0].clone(), keys[0].clone()];
        let mut dst = vec![PropertyList::new(); 2];
        backend.get_multi(&ctx, &twice, &mut dst).unwrap();
        assert_eq!(dst[0], dst[1]);
    }
}

#[test]
fn incomplete_keys_are_completed() {
    let ctx = Context::background();
    for backend in backends() {
        let parent = Key::name_key("Parent", "p", None);
        let keys = backend
            .put_multi(
                &ctx,
                &[Key::incomplete_key("Data", Some(&parent))],
                &[named("child")],
            )
            .unwrap();
        assert!(!keys[0].incomplete());
        assert_eq!(keys[0].parent(), Some(&parent));

        let allocated = backend
            .allocate_ids(&ctx, &[Key::incomplete_key("Data", None)])
            .unwrap();
        assert_ne!(allocated[0], keys[0]);

        let err = backend
            .allocate_ids(&ctx, &[Key::id_key("Data", 4, None)])
            .unwrap_err();
        assert!(matches!(err, DsError::Multi(_)));
    }
}

#[test]
fn queries_page_through_all_rows() {
    let ctx = Context::background();
    for backend in backends() {
        let keys = seed(backend.as_ref(), &ctx, 7);

        let mut rows = Vec::new();
        let found = backend
            .get_all(&ctx, &Query::new("Data").order("-Name"), &mut rows)
            .unwrap();
        let expected: Vec<Key> = keys.iter().rev().cloned().collect();
        assert_eq!(found, expected, "{}", backend.name());

        let windowed = backend
            .get_all(&ctx, &Query::new("Data").offset(2).limit(4), &mut Vec::new())
            .unwrap();
        assert_eq!(windowed, keys[2..6].to_vec(), "{}", backend.name());

        assert_eq!(backend.count(&ctx, &Query::new("Data")).unwrap(), 7);
        assert_eq!(
            backend
                .count(&ctx, &Query::new("Data").filter("Name >", "#4"))
                .unwrap(),
            3
        );
    }
}

#[test]
fn cursors_resume_queries() {
    let ctx = Context::background();
    for backend in backends() {
        let keys = seed(backend.as_ref(), &ctx, 5);
        let mut iter = backend.run(&ctx, &Query::new("Data")).unwrap();
        let mut row = PropertyList::new();
        iter.next(&ctx, &mut row).unwrap();
        iter.next(&ctx, &mut row).unwrap();
        let cursor = iter.cursor().unwrap();

        let rest = backend
            .get_all(&ctx, &Query::new("Data").start(cursor), &mut Vec::new())
            .unwrap();
        assert_eq!(rest, keys[2..].to_vec(), "{}", backend.name());
    }
}

#[test]
fn projections_return_only_projected_properties() {
    let ctx = Context::background();
    for backend in backends() {
        let key = Key::id_key("Data", 1, None);
        let mut props = named("n");
        props.push_value("Age", 3i64, false);
        backend.put_multi(&ctx, &[key], &[props]).unwrap();

        let mut rows = Vec::new();
        backend
            .get_all(&ctx, &Query::new("Data").project(&["Age"]), &mut rows)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0].get("Age"), Some(&Value::Int(3)));
    }
}

#[test]
fn transactions_conflict_and_resolve_pending_keys() {
    let ctx = Context::background();
    for backend in backends() {
        let keys = seed(backend.as_ref(), &ctx, 1);

        let tx = backend.new_transaction(&ctx).unwrap();
        let pending = tx
            .put_multi(&ctx, &[Key::incomplete_key("Data", None)], &[named("new")])
            .unwrap();
        let commit = tx.commit(&ctx).unwrap();
        let resolved = commit.key(&pending[0]).unwrap();
        assert!(!resolved.incomplete());
        let mut dst = vec![PropertyList::new()];
        backend.get_multi(&ctx, &[resolved], &mut dst).unwrap();
        assert_eq!(dst[0], named("new"));

        let tx = backend.new_transaction(&ctx).unwrap();
        tx.get_multi(&ctx, &keys, &mut dst).unwrap();
        backend.put_multi(&ctx, &keys, &[named("other")]).unwrap();
        tx.put_multi(&ctx, &keys, &[named("mine")]).unwrap();
        assert_eq!(tx.commit(&ctx).unwrap_err(), DsError::ConcurrentTransaction);

        assert!(matches!(
            tx.rollback(&ctx),
            Err(DsError::InvalidOperation { .. })
        ));
    }
}

#[test]
fn rolled_back_writes_are_invisible() {
    let ctx = Context::background();
    for backend in backends() {
        let key = Key::id_key("Data", 42, None);
        let tx = backend.new_transaction(&ctx).unwrap();
        tx.put_multi(&ctx, &[key.clone()], &[named("x")]).unwrap();
        tx.rollback(&ctx).unwrap();

        let mut dst = vec![PropertyList::new()];
        let err = backend.get_multi(&ctx, &[key], &mut dst).unwrap_err();
        let DsError::Multi(errs) = err else {
            panic!("expected multi error");
        };
        assert_eq!(errs.get(0), Some(&DsError::NoSuchEntity));
    }
}

#[test]
fn keys_encode_identically_across_adapters() {
    let key = Key::name_key("Data", "shared", Some(&Key::id_key("Parent", 1, None)));
    let encodings: Vec<String> = backends().iter().map(|b| b.encode_key(&key)).collect();
    assert_eq!(encodings[0], encodings[1]);
    assert_eq!(backends()[1].decode_key(&encodings[0]).unwrap(), key);
}

#[test]
fn cloud_lookups_retry_deferred_keys() {
    let ctx = Context::background();
    let engine = Arc::new(Engine::new());
    let service = Arc::new(LoopbackService::new(Arc::clone(&engine)).with_lookup_limit(2));
    let backend = CloudBackend::new("p", service.clone());
    let keys = seed(&backend, &ctx, 5);

    let before = service.request_count();
    let mut dst = vec![PropertyList::new(); 5];
    backend.get_multi(&ctx, &keys, &mut dst).unwrap();
    assert_eq!(service.request_count() - before, 3);
    assert_eq!(dst[4], named("#5"));
}

#[test]
fn cloud_queries_fetch_pages_on_demand() {
    let ctx = Context::background();
    let backend = CloudBackend::with_options(
        "p",
        Arc::new(LoopbackService::new(Arc::new(Engine::new()))),
        &ClientOptions::new().query_batch_size(2),
    );
    seed(&backend, &ctx, 5);

    let mut iter = backend.run(&ctx, &Query::new("Data")).unwrap();
    let mut row = PropertyList::new();
    while iter.next(&ctx, &mut row).is_ok() {}
    let pages = iter
        .as_any_mut()
        .downcast_mut::<CloudIterator>()
        .map(|i| i.pages())
        .unwrap();
    assert_eq!(pages, 3);
}

#[test]
fn cloud_calls_carry_the_token() {
    let ctx = Context::background();
    let service = Arc::new(LoopbackService::new(Arc::new(Engine::new())).require_token("t0k"));

    let anonymous = CloudBackend::new("p", service.clone());
    let err = anonymous
        .allocate_ids(&ctx, &[Key::incomplete_key("Data", None)])
        .unwrap_err();
    assert!(matches!(
        err,
        DsError::Backend {
            code: dsclient_codec::ErrorCode::Unauthenticated,
            ..
        }
    ));

    let authed = CloudBackend::with_options(
        "p",
        service,
        &ClientOptions::new().token_source(Arc::new(StaticTokenSource::new("t0k"))),
    );
    assert!(authed
        .allocate_ids(&ctx, &[Key::incomplete_key("Data", None)])
        .is_ok());
}
