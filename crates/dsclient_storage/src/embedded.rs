//! Embedded (legacy) adapter.
//!
//! Calls the in-process [`Engine`] directly. Engine errors are translated
//! into the client taxonomy here; nothing else in this module knows about
//! them.

use crate::backend::{check_lengths, reject_invalid, Backend, BackendTransaction, RawIterator};
use crate::config::ClientOptions;
use crate::engine::{Engine, EngineTransaction, QueryRows};
use crate::registry::register_factory;
use dsclient_codec::{
    Commit, Context, Cursor, DsError, DsResult, Key, MultiError, PendingKey, PropertyList, Query,
    TransactionId,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry name of the adapter.
pub const NAME: &str = "embedded";

/// Project used when none can be resolved.
pub const DEFAULT_PROJECT: &str = "local";

static ENGINES: Lazy<Mutex<HashMap<String, Arc<Engine>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// The process-global engine of `project`, created on first use.
pub fn shared_engine(project: &str) -> Arc<Engine> {
    Arc::clone(
        ENGINES
            .lock()
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(Engine::new())),
    )
}

/// Installs this adapter as the process backend. Returns false if another
/// adapter registered first.
pub fn register() -> bool {
    register_factory(NAME, open)
}

/// Factory building an embedded backend on the project's shared engine.
///
/// # Errors
///
/// Returns [`DsError::Config`] if project id resolution fails.
pub fn open(_ctx: &Context, options: &ClientOptions) -> DsResult<Arc<dyn Backend>> {
    let project = options
        .resolve_project_id()?
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
    debug!(%project, "opening embedded backend");
    Ok(Arc::new(EmbeddedBackend::new(shared_engine(&project))))
}

fn fill_found(found: Vec<Option<PropertyList>>, dst: &mut [PropertyList]) -> DsResult<()> {
    let mut errs = MultiError::new(found.len());
    for (i, (entity, slot)) in found.into_iter().zip(dst.iter_mut()).enumerate() {
        match entity {
            Some(properties) => *slot = properties,
            None => errs.set(i, DsError::NoSuchEntity),
        }
    }
    errs.into_result()
}

/// Backend calling an [`Engine`] in-process.
#[derive(Debug)]
pub struct EmbeddedBackend {
    engine: Arc<Engine>,
    closed: AtomicBool,
}

impl EmbeddedBackend {
    /// Creates a backend over `engine`.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            closed: AtomicBool::new(false),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn check(&self, ctx: &Context) -> DsResult<()> {
        ctx.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DsError::invalid_operation("backend is closed"));
        }
        Ok(())
    }
}

impl Backend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> DsResult<Vec<Key>> {
        self.check(ctx)?;
        let mut errs = MultiError::new(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if !key.valid() || !key.incomplete() {
                errs.set(i, DsError::InvalidKey);
            }
        }
        errs.into_result()?;
        Ok(self.engine.allocate_ids(keys)?)
    }

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Key>> {
        self.check(ctx)?;
        check_lengths(keys.len(), entities.len())?;
        if let Some(err) = reject_invalid(keys, true) {
            return Err(err);
        }
        Ok(self.engine.put(keys, entities.to_vec())?)
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.check(ctx)?;
        check_lengths(keys.len(), dst.len())?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        fill_found(self.engine.get(keys)?, dst)
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        self.check(ctx)?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        Ok(self.engine.delete(keys)?)
    }

    fn new_transaction(&self, ctx: &Context) -> DsResult<Box<dyn BackendTransaction>> {
        self.check(ctx)?;
        let txn = self.engine.begin()?;
        Ok(Box::new(EmbeddedTransaction {
            id: txn.id(),
            engine: Arc::clone(&self.engine),
            txn: Mutex::new(txn),
        }))
    }

    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        self.check(ctx)?;
        let rows = self.engine.run(query)?;
        Ok(Box::new(EmbeddedIterator::new(rows)))
    }

    fn close(&self) -> DsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DsError::invalid_operation("backend already closed"));
        }
        Ok(())
    }
}

/// A transaction on an [`EmbeddedBackend`].
#[derive(Debug)]
pub struct EmbeddedTransaction {
    id: TransactionId,
    engine: Arc<Engine>,
    txn: Mutex<EngineTransaction>,
}

impl BackendTransaction for EmbeddedTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<PendingKey>> {
        ctx.check()?;
        check_lengths(keys.len(), entities.len())?;
        if let Some(err) = reject_invalid(keys, true) {
            return Err(err);
        }
        let mut txn = self.txn.lock();
        Ok(self.engine.put_in(&mut txn, keys, entities.to_vec())?)
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        ctx.check()?;
        check_lengths(keys.len(), dst.len())?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        let found = self.engine.get_in(&mut self.txn.lock(), keys)?;
        fill_found(found, dst)
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        ctx.check()?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        Ok(self.engine.delete_in(&mut self.txn.lock(), keys)?)
    }

    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        ctx.check()?;
        let rows = self.engine.run_in(&mut self.txn.lock(), query)?;
        Ok(Box::new(EmbeddedIterator::new(rows)))
    }

    fn commit(&self, ctx: &Context) -> DsResult<Commit> {
        ctx.check()?;
        Ok(self.engine.commit(&mut self.txn.lock())?)
    }

    fn rollback(&self, _ctx: &Context) -> DsResult<()> {
        Ok(self.engine.rollback(&mut self.txn.lock())?)
    }
}

/// Iterator over engine query rows held in memory.
#[derive(Debug)]
pub struct EmbeddedIterator {
    rows: QueryRows,
    next: usize,
}

impl EmbeddedIterator {
    fn new(rows: QueryRows) -> Self {
        Self { rows, next: 0 }
    }

    /// Rows not yet returned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rows.rows.len() - self.next
    }
}

impl RawIterator for EmbeddedIterator {
    fn next(&mut self, ctx: &Context, dst: &mut PropertyList) -> DsResult<Key> {
        ctx.check()?;
        let row = self.rows.rows.get(self.next).ok_or(DsError::Done)?;
        *dst = row.properties.clone();
        self.next += 1;
        Ok(row.key.clone())
    }

    fn cursor(&self) -> DsResult<Cursor> {
        Ok(self.rows.cursor_at(self.next))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> EmbeddedBackend {
        EmbeddedBackend::new(Arc::new(Engine::new()))
    }

    fn named(name: &str) -> PropertyList {
        let mut props = PropertyList::new();
        props.push_value("Name", name, false);
        props
    }

    #[test]
    fn missing_entities_are_reported_per_index() {
        let ctx = Context::background();
        let backend = backend();
        let keys: Vec<Key> = (1..=3).map(|id| Key::id_key("Data", id, None)).collect();
        backend
            .put_multi(&ctx, &keys[..1], &[named("one")])
            .unwrap();

        let mut dst = vec![PropertyList::new(); 3];
        let err = backend.get_multi(&ctx, &keys, &mut dst).unwrap_err();
        let DsError::Multi(errs) = err else {
            panic!("expected multi error, got {err:?}");
        };
        assert_eq!(errs.len(), 3);
        assert!(errs.get(0).is_none());
        assert_eq!(errs.get(1), Some(&DsError::NoSuchEntity));
        assert_eq!(dst[0], named("one"));
    }

    #[test]
    fn invalid_keys_fail_before_any_write() {
        let ctx = Context::background();
        let backend = backend();
        let keys = vec![Key::id_key("Data", 1, None), Key::id_key("", 2, None)];
        let err = backend
            .put_multi(&ctx, &keys, &[named("a"), named("b")])
            .unwrap_err();

        let DsError::Multi(errs) = err else {
            panic!("expected multi error");
        };
        assert_eq!(errs.get(1), Some(&DsError::InvalidKey));
        assert!(backend.engine().is_empty());
    }

    #[test]
    fn length_mismatch_is_invalid_argument() {
        let ctx = Context::background();
        let err = backend()
            .put_multi(&ctx, &[Key::id_key("Data", 1, None)], &[])
            .unwrap_err();
        assert!(matches!(err, DsError::InvalidArgument { .. }));
    }

    #[test]
    fn conflict_surfaces_as_concurrent_transaction() {
        let ctx = Context::background();
        let backend = backend();
        let key = Key::id_key("Data", 1, None);
        backend.put_multi(&ctx, &[key.clone()], &[named("a")]).unwrap();

        let tx = backend.new_transaction(&ctx).unwrap();
        let mut dst = vec![PropertyList::new()];
        tx.get_multi(&ctx, &[key.clone()], &mut dst).unwrap();
        backend.put_multi(&ctx, &[key.clone()], &[named("b")]).unwrap();
        tx.put_multi(&ctx, &[key], &[named("c")]).unwrap();

        assert_eq!(tx.commit(&ctx).unwrap_err(), DsError::ConcurrentTransaction);
    }

    #[test]
    fn iterator_reports_cursors_and_done() {
        let ctx = Context::background();
        let backend = backend();
        let keys: Vec<Key> = (1..=3).map(|id| Key::id_key("Data", id, None)).collect();
        let entities: Vec<PropertyList> = (1..=3).map(|i| named(&format!("#{i}"))).collect();
        backend.put_multi(&ctx, &keys, &entities).unwrap();

        let mut iter = backend.run(&ctx, &Query::new("Data")).unwrap();
        let mut row = PropertyList::new();
        assert_eq!(iter.next(&ctx, &mut row).unwrap(), keys[0]);
        let cursor = iter.cursor().unwrap();

        let mut rest = backend.run(&ctx, &Query::new("Data").start(cursor)).unwrap();
        assert_eq!(rest.next(&ctx, &mut row).unwrap(), keys[1]);
        assert_eq!(row, entities[1]);

        let mut last = backend.run(&ctx, &Query::new("Data").offset(2)).unwrap();
        last.next(&ctx, &mut row).unwrap();
        assert_eq!(last.next(&ctx, &mut row).unwrap_err(), DsError::Done);
        assert_eq!(backend.count(&ctx, &Query::new("Data")).unwrap(), 3);
    }

    #[test]
    fn canceled_context_stops_calls() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = backend().allocate_ids(&ctx, &[Key::incomplete_key("Data", None)]);
        assert_eq!(err.unwrap_err(), DsError::Canceled);
    }

    #[test]
    fn closing_twice_fails() {
        let backend = backend();
        backend.close().unwrap();
        assert!(backend.close().is_err());
        assert!(backend
            .delete_multi(&Context::background(), &[Key::id_key("Data", 1, None)])
            .is_err());
    }
}
