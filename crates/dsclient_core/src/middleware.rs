//! The middleware chain.
//!
//! Every backend-directed operation issued by a [`Client`] flows through the
//! middlewares appended to it, then reaches the backend adapter. A middleware
//! receives a [`MiddlewareInfo`] and continues the call with
//! `info.next.<operation>(info, ...)`. Each such call advances the chain by
//! one position; the position past the last middleware is the backend.
//!
//! The first-appended middleware is the outermost one: it sees a request first
//! and its response last.
//!
//! ```rust,ignore
//! struct Audit;
//!
//! impl Middleware for Audit {
//!     fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
//!         tracing::info!(count = keys.len(), "deleting");
//!         info.next.delete_multi_without_tx(info, keys)
//!     }
//! }
//! ```

use crate::client::Client;
use crate::transaction::Transaction;
use dsclient_codec::{Commit, Context, DsResult, Key, PendingKey, PropertyList, Query};
use dsclient_storage::{count_rows, drain, Backend, RawIterator};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// One handler in the chain.
///
/// Every method forwards to the next position by default, so an
/// implementation only overrides the operations it intercepts. Implementations
/// are shared between threads and must guard their own state.
pub trait Middleware: Send + Sync {
    /// Completes incomplete keys.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        info.next.allocate_ids(info, keys)
    }

    /// Stores entities outside a transaction.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        info.next.put_multi_without_tx(info, keys, entities)
    }

    /// Stages entities in `info.transaction`.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        info.next.put_multi_with_tx(info, keys, entities)
    }

    /// Reads entities outside a transaction.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own. Per-key failures are
    /// reported in an index-aligned multi-error.
    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        info.next.get_multi_without_tx(info, keys, dst)
    }

    /// Reads entities inside `info.transaction`.
    ///
    /// # Errors
    ///
    /// Same as [`get_multi_without_tx`](Self::get_multi_without_tx).
    fn get_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        info.next.get_multi_with_tx(info, keys, dst)
    }

    /// Deletes entities outside a transaction.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        info.next.delete_multi_without_tx(info, keys)
    }

    /// Stages deletions in `info.transaction`.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        info.next.delete_multi_with_tx(info, keys)
    }

    /// Runs after `tx` committed. `commit` resolves the transaction's pending keys.
    ///
    /// # Errors
    ///
    /// Errors are reported as the commit's error.
    fn post_commit(&self, info: &MiddlewareInfo, tx: &Transaction, commit: &Commit) -> DsResult<()> {
        info.next.post_commit(info, tx, commit)
    }

    /// Runs after `tx` was rolled back or failed to commit.
    ///
    /// # Errors
    ///
    /// Errors are reported as the rollback's error.
    fn post_rollback(&self, info: &MiddlewareInfo, tx: &Transaction) -> DsResult<()> {
        info.next.post_rollback(info, tx)
    }

    /// Starts a query.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        info.next.run(info, query)
    }

    /// Collects every row of a query.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn get_all(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        dst: &mut Vec<PropertyList>,
    ) -> DsResult<Vec<Key>> {
        info.next.get_all(info, query, dst)
    }

    /// Advances an iterator created by [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// [`DsError::Done`](dsclient_codec::DsError::Done) once the rows are
    /// exhausted.
    fn next(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        iter: &mut dyn RawIterator,
        dst: &mut PropertyList,
    ) -> DsResult<Key> {
        info.next.next(info, query, iter, dst)
    }

    /// Counts the rows of a query.
    ///
    /// # Errors
    ///
    /// Downstream errors, or the middleware's own.
    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        info.next.count(info, query)
    }
}

/// Per-call information handed to every middleware.
#[derive(Clone)]
pub struct MiddlewareInfo {
    /// The ambient context of the call.
    pub context: Context,
    /// The client the call was issued on.
    pub client: Client,
    /// The transaction the call belongs to, if any.
    pub transaction: Option<Transaction>,
    /// Forward cursor into the chain.
    pub next: Next,
}

impl MiddlewareInfo {
    pub(crate) fn new(
        context: Context,
        client: Client,
        transaction: Option<Transaction>,
        middlewares: Arc<[Arc<dyn Middleware>]>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            context,
            client,
            transaction,
            next: Next {
                middlewares,
                backend,
                pos: 0,
            },
        }
    }

    /// Returns a copy of this info carrying `context`.
    #[must_use]
    pub fn with_context(&self, context: Context) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    fn advanced(&self, next: Next) -> Self {
        Self {
            next,
            ..self.clone()
        }
    }
}

impl fmt::Debug for MiddlewareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareInfo")
            .field("transaction", &self.transaction.as_ref().map(Transaction::id))
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// Forward cursor into the chain.
///
/// Calling an operation on `Next` invokes the middleware at the cursor with a
/// copy of the info whose cursor has moved one position further. Past the
/// last middleware, the call reaches the backend (or the backend transaction
/// when the info carries one).
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    backend: Arc<dyn Backend>,
    pos: usize,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("pos", &self.pos)
            .field("len", &self.middlewares.len())
            .field("backend", &self.backend.name())
            .finish()
    }
}

enum Step<'a> {
    Middleware(&'a dyn Middleware, MiddlewareInfo),
    Backend,
}

impl Next {
    /// Chain position of the middleware this cursor invokes next.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns true once the cursor points past every middleware.
    #[must_use]
    pub fn at_backend(&self) -> bool {
        self.pos >= self.middlewares.len()
    }

    fn step(&self, info: &MiddlewareInfo, op: &'static str) -> Step<'_> {
        match self.middlewares.get(self.pos) {
            Some(middleware) => {
                let next = Self {
                    pos: self.pos + 1,
                    ..self.clone()
                };
                Step::Middleware(middleware.as_ref(), info.advanced(next))
            }
            None => {
                trace!(op, backend = self.backend.name(), "chain reached backend");
                Step::Backend
            }
        }
    }

    fn transaction<'i>(info: &'i MiddlewareInfo, op: &str) -> DsResult<&'i Transaction> {
        info.transaction.as_ref().ok_or_else(|| {
            dsclient_codec::DsError::invalid_operation(format!("{op} requires a transaction"))
        })
    }

    /// Forwards [`Middleware::allocate_ids`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        match self.step(info, "allocate_ids") {
            Step::Middleware(m, info) => m.allocate_ids(&info, keys),
            Step::Backend => self.backend.allocate_ids(&info.context, keys),
        }
    }

    /// Forwards [`Middleware::put_multi_without_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        match self.step(info, "put_multi_without_tx") {
            Step::Middleware(m, info) => m.put_multi_without_tx(&info, keys, entities),
            Step::Backend => self.backend.put_multi(&info.context, keys, entities),
        }
    }

    /// Forwards [`Middleware::put_multi_with_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        match self.step(info, "put_multi_with_tx") {
            Step::Middleware(m, info) => m.put_multi_with_tx(&info, keys, entities),
            Step::Backend => Self::transaction(info, "put_multi_with_tx")?
                .raw()
                .put_multi(&info.context, keys, entities),
        }
    }

    /// Forwards [`Middleware::get_multi_without_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        match self.step(info, "get_multi_without_tx") {
            Step::Middleware(m, info) => m.get_multi_without_tx(&info, keys, dst),
            Step::Backend => self.backend.get_multi(&info.context, keys, dst),
        }
    }

    /// Forwards [`Middleware::get_multi_with_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn get_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        match self.step(info, "get_multi_with_tx") {
            Step::Middleware(m, info) => m.get_multi_with_tx(&info, keys, dst),
            Step::Backend => Self::transaction(info, "get_multi_with_tx")?
                .raw()
                .get_multi(&info.context, keys, dst),
        }
    }

    /// Forwards [`Middleware::delete_multi_without_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        match self.step(info, "delete_multi_without_tx") {
            Step::Middleware(m, info) => m.delete_multi_without_tx(&info, keys),
            Step::Backend => self.backend.delete_multi(&info.context, keys),
        }
    }

    /// Forwards [`Middleware::delete_multi_with_tx`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        match self.step(info, "delete_multi_with_tx") {
            Step::Middleware(m, info) => m.delete_multi_with_tx(&info, keys),
            Step::Backend => Self::transaction(info, "delete_multi_with_tx")?
                .raw()
                .delete_multi(&info.context, keys),
        }
    }

    /// Forwards [`Middleware::post_commit`]. The backend ignores it.
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn post_commit(&self, info: &MiddlewareInfo, tx: &Transaction, commit: &Commit) -> DsResult<()> {
        match self.step(info, "post_commit") {
            Step::Middleware(m, info) => m.post_commit(&info, tx, commit),
            Step::Backend => Ok(()),
        }
    }

    /// Forwards [`Middleware::post_rollback`]. The backend ignores it.
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn post_rollback(&self, info: &MiddlewareInfo, tx: &Transaction) -> DsResult<()> {
        match self.step(info, "post_rollback") {
            Step::Middleware(m, info) => m.post_rollback(&info, tx),
            Step::Backend => Ok(()),
        }
    }

    /// Forwards [`Middleware::run`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        match self.step(info, "run") {
            Step::Middleware(m, info) => m.run(&info, query),
            Step::Backend => match &info.transaction {
                Some(tx) => tx.raw().run(&info.context, query),
                None => self.backend.run(&info.context, query),
            },
        }
    }

    /// Forwards [`Middleware::get_all`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn get_all(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        dst: &mut Vec<PropertyList>,
    ) -> DsResult<Vec<Key>> {
        match self.step(info, "get_all") {
            Step::Middleware(m, info) => m.get_all(&info, query, dst),
            Step::Backend => match &info.transaction {
                Some(tx) => {
                    let mut iter = tx.raw().run(&info.context, query)?;
                    drain(&info.context, iter.as_mut(), dst)
                }
                None => self.backend.get_all(&info.context, query, dst),
            },
        }
    }

    /// Forwards [`Middleware::next`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn next(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        iter: &mut dyn RawIterator,
        dst: &mut PropertyList,
    ) -> DsResult<Key> {
        match self.step(info, "next") {
            Step::Middleware(m, info) => m.next(&info, query, iter, dst),
            Step::Backend => iter.next(&info.context, dst),
        }
    }

    /// Forwards [`Middleware::count`].
    ///
    /// # Errors
    ///
    /// Errors of the remaining chain.
    pub fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        match self.step(info, "count") {
            Step::Middleware(m, info) => m.count(&info, query),
            Step::Backend => match &info.transaction {
                Some(tx) => {
                    let counted = if query.projection().is_empty() {
                        query.clone().keys_only()
                    } else {
                        query.clone()
                    };
                    let mut iter = tx.raw().run(&info.context, &counted)?;
                    count_rows(&info.context, iter.as_mut())
                }
                None => self.backend.count(&info.context, query),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::DsError;
    use dsclient_storage::embedded::EmbeddedBackend;
    use dsclient_storage::{ClientOptions, Engine};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Tracer {
        name: &'static str,
        log: Log,
    }

    impl Middleware for Tracer {
        fn put_multi_without_tx(
            &self,
            info: &MiddlewareInfo,
            keys: &[Key],
            entities: &[PropertyList],
        ) -> DsResult<Vec<Key>> {
            self.log.lock().push(format!("{}.before@{}", self.name, info.next.position()));
            let result = info.next.put_multi_without_tx(info, keys, entities);
            self.log.lock().push(format!("{}.after", self.name));
            result
        }
    }

    struct Refuse;

    impl Middleware for Refuse {
        fn delete_multi_without_tx(&self, _info: &MiddlewareInfo, _keys: &[Key]) -> DsResult<()> {
            Err(DsError::invalid_operation("deletes are disabled"))
        }
    }

    fn client() -> (Client, Arc<Engine>) {
        let engine = Arc::new(Engine::new());
        let client = Client::new(
            Arc::new(EmbeddedBackend::new(Arc::clone(&engine))),
            ClientOptions::default(),
        );
        (client, engine)
    }

    #[test]
    fn first_appended_is_outermost() {
        let (client, engine) = client();
        let log: Log = Arc::default();
        for name in ["m1", "m2", "m3"] {
            client.append_middleware(Arc::new(Tracer {
                name,
                log: Arc::clone(&log),
            }));
        }

        let key = Key::id_key("Data", 1, None);
        client
            .put_properties(&Context::background(), &[key.clone()], &[PropertyList::new()])
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "m1.before@1",
                "m2.before@2",
                "m3.before@3",
                "m3.after",
                "m2.after",
                "m1.after",
            ]
        );
        assert!(engine.contains(&key));
    }

    #[test]
    fn middleware_can_short_circuit() {
        let (client, engine) = client();
        let key = Key::id_key("Data", 1, None);
        client
            .put_properties(&Context::background(), &[key.clone()], &[PropertyList::new()])
            .unwrap();
        client.append_middleware(Arc::new(Refuse));

        let err = client.delete(&Context::background(), &key).unwrap_err();
        assert!(matches!(err, DsError::InvalidOperation { .. }));
        assert!(engine.contains(&key));
    }

    #[test]
    fn empty_chain_reaches_backend() {
        let (client, _) = client();
        let info = client.info(&Context::background(), None);
        assert!(info.next.at_backend());
        let keys = info
            .next
            .allocate_ids(&info, &[Key::incomplete_key("Data", None)])
            .unwrap();
        assert!(!keys[0].incomplete());
    }

    #[test]
    fn with_tx_operations_need_a_transaction() {
        let (client, _) = client();
        let info = client.info(&Context::background(), None);
        let err = info
            .next
            .delete_multi_with_tx(&info, &[Key::id_key("Data", 1, None)])
            .unwrap_err();
        assert!(matches!(err, DsError::InvalidOperation { .. }));
    }

    proptest::proptest! {
        #[test]
        fn chain_nests_in_append_order(count in 1usize..8) {
            let (client, _) = client();
            let log: Log = Arc::default();
            let names = ["m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7"];
            for &name in &names[..count] {
                client.append_middleware(Arc::new(Tracer {
                    name,
                    log: Arc::clone(&log),
                }));
            }

            client
                .put_properties(&Context::background(), &[Key::id_key("Data", 1, None)], &[PropertyList::new()])
                .unwrap();

            let mut expected: Vec<String> = names[..count]
                .iter()
                .enumerate()
                .map(|(i, name)| format!("{name}.before@{}", i + 1))
                .collect();
            expected.extend(names[..count].iter().rev().map(|name| format!("{name}.after")));
            proptest::prop_assert_eq!(&*log.lock(), &expected);
        }
    }
}
