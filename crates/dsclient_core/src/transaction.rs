//! Client-level transactions.
//!
//! A [`Transaction`] wraps a backend transaction and routes its operations
//! through the `*_with_tx` side of the middleware chain. Commit and rollback
//! notify the chain through `post_commit` and `post_rollback`, which is where
//! caching middlewares apply or drop what they recorded.

use crate::batch::{BatchQueues, TransactionBatch};
use crate::client::{check_lengths, collect_all, load_all, save_all, Client};
use crate::iterator::QueryIterator;
use crate::middleware::MiddlewareInfo;
use dsclient_codec::{
    load_entity, Commit, Context, DsError, DsResult, Entity, Key, PendingKey, PropertyList,
    PropertyLoadSaver, Query, TransactionId,
};
use dsclient_storage::BackendTransaction;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Operations are accepted.
    Active,
    /// The commit succeeded.
    Committed,
    /// The transaction was rolled back.
    RolledBack,
    /// The commit failed; nothing was written.
    Failed,
}

impl TransactionState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        }
    }
}

/// A transaction handle. Clones refer to the same transaction.
///
/// Writes are invisible outside the transaction until [`commit`](Self::commit)
/// returns. A transaction is not meant to be driven from several threads at
/// once.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    client: Client,
    context: Context,
    raw: Box<dyn BackendTransaction>,
    state: Mutex<TransactionState>,
    batch: OnceCell<Arc<BatchQueues<PendingKey>>>,
}

impl Transaction {
    pub(crate) fn new(client: Client, context: Context, raw: Box<dyn BackendTransaction>) -> Self {
        debug!(transaction = %raw.id(), "transaction begun");
        Self {
            inner: Arc::new(TransactionInner {
                client,
                context,
                raw,
                state: Mutex::new(TransactionState::Active),
                batch: OnceCell::new(),
            }),
        }
    }

    /// The transaction's identity.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.raw.id()
    }

    /// The client the transaction was begun on.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The context the transaction was begun with.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Returns true while operations are accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns true when both handles refer to the same transaction.
    #[must_use]
    pub fn same(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn raw(&self) -> &dyn BackendTransaction {
        self.inner.raw.as_ref()
    }

    pub(crate) fn ensure_active(&self) -> DsResult<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(DsError::invalid_operation(format!(
                "transaction {} already {}",
                self.id(),
                state.as_str()
            ))),
        }
    }

    fn info(&self) -> MiddlewareInfo {
        self.inner.client.info(&self.inner.context, Some(self))
    }

    /// Stages one value.
    ///
    /// # Errors
    ///
    /// Returns the save or backend error, or an error once the transaction
    /// finished.
    pub fn put<T: PropertyLoadSaver + ?Sized>(&self, key: &Key, src: &T) -> DsResult<PendingKey> {
        let properties = src.save(&self.inner.context)?;
        let mut pending = self
            .put_properties(std::slice::from_ref(key), &[properties])
            .map_err(DsError::unwrap_single)?;
        pending
            .pop()
            .ok_or_else(|| DsError::invalid_operation("backend returned no pending key"))
    }

    /// Stages values; keys and values are index-aligned.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error when any value fails.
    pub fn put_multi<T: PropertyLoadSaver>(&self, keys: &[Key], src: &[T]) -> DsResult<Vec<PendingKey>> {
        check_lengths(keys.len(), src.len())?;
        let entities = save_all(&self.inner.context, src)?;
        self.put_properties(keys, &entities)
    }

    /// Stages property lists through the chain without the codec.
    ///
    /// # Errors
    ///
    /// Errors of the chain.
    pub fn put_properties(&self, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<PendingKey>> {
        self.ensure_active()?;
        check_lengths(keys.len(), entities.len())?;
        let info = self.info();
        info.next.put_multi_with_tx(&info, keys, entities)
    }

    /// Reads one entity as of the transaction's snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::NoSuchEntity`] when the entity is missing.
    pub fn get<T: PropertyLoadSaver + ?Sized>(&self, key: &Key, dst: &mut T) -> DsResult<()> {
        let mut props = vec![PropertyList::new()];
        self.get_properties(std::slice::from_ref(key), &mut props)
            .map_err(DsError::unwrap_single)?;
        let properties = props.pop().unwrap_or_default();
        load_entity(&self.inner.context, dst, Entity::new(Some(key.clone()), properties))
    }

    /// Reads entities; keys and destinations are index-aligned.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error.
    pub fn get_multi<T: PropertyLoadSaver>(&self, keys: &[Key], dst: &mut [T]) -> DsResult<()> {
        check_lengths(keys.len(), dst.len())?;
        let mut props = vec![PropertyList::new(); keys.len()];
        let fetched = self.get_properties(keys, &mut props);
        load_all(&self.inner.context, keys, props, dst, fetched)
    }

    /// Reads property lists through the chain without the codec.
    ///
    /// # Errors
    ///
    /// Errors of the chain.
    pub fn get_properties(&self, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.ensure_active()?;
        check_lengths(keys.len(), dst.len())?;
        let info = self.info();
        info.next.get_multi_with_tx(&info, keys, dst)
    }

    /// Stages the deletion of one entity.
    ///
    /// # Errors
    ///
    /// Returns the backend error for the key.
    pub fn delete(&self, key: &Key) -> DsResult<()> {
        self.delete_multi(std::slice::from_ref(key))
            .map_err(DsError::unwrap_single)
    }

    /// Stages deletions.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error for rejected keys.
    pub fn delete_multi(&self, keys: &[Key]) -> DsResult<()> {
        self.ensure_active()?;
        let info = self.info();
        info.next.delete_multi_with_tx(&info, keys)
    }

    /// Starts a query bound to the transaction.
    ///
    /// # Errors
    ///
    /// Returns the query's builder error or the chain's error.
    pub fn run(&self, query: &Query) -> DsResult<QueryIterator> {
        self.ensure_active()?;
        QueryIterator::start(
            self.inner.client.clone(),
            self.inner.context.clone(),
            Some(self.clone()),
            self.bind(query),
        )
    }

    /// Counts the rows of a query bound to the transaction.
    ///
    /// # Errors
    ///
    /// Returns the query's builder error or the chain's error.
    pub fn count(&self, query: &Query) -> DsResult<usize> {
        self.ensure_active()?;
        let query = self.bind(query);
        query.validate()?;
        let info = self.info();
        info.next.count(&info, &query)
    }

    /// Loads every row of a query bound to the transaction.
    ///
    /// # Errors
    ///
    /// Returns the chain's error, or the first load error.
    pub fn get_all<T: PropertyLoadSaver + Default>(&self, query: &Query, dst: &mut Vec<T>) -> DsResult<Vec<Key>> {
        self.ensure_active()?;
        let query = self.bind(query);
        query.validate()?;
        collect_all(&self.info(), &query, dst)
    }

    fn bind(&self, query: &Query) -> Query {
        query.clone().transaction(self.id())
    }

    /// The batch dispatching through this transaction.
    #[must_use]
    pub fn batch(&self) -> TransactionBatch {
        let queues = self.inner.batch.get_or_init(|| Arc::new(BatchQueues::new()));
        TransactionBatch::new(self.clone(), Arc::clone(queues))
    }

    /// Commits the transaction and notifies the chain.
    ///
    /// A failed commit leaves the transaction `Failed` and runs the chain's
    /// `post_rollback`.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::ConcurrentTransaction`] when another writer won, or
    /// an error from `post_commit`.
    pub fn commit(&self) -> DsResult<Commit> {
        self.ensure_active()?;
        let result = self.inner.raw.commit(&self.inner.context);
        match result {
            Ok(commit) => {
                *self.inner.state.lock() = TransactionState::Committed;
                debug!(transaction = %self.id(), puts = commit.keys().len(), "transaction committed");
                let info = self.info();
                info.next.post_commit(&info, self, &commit)?;
                Ok(commit)
            }
            Err(err) => {
                *self.inner.state.lock() = TransactionState::Failed;
                debug!(transaction = %self.id(), error = %err, "transaction commit failed");
                let info = self.info();
                if let Err(post) = info.next.post_rollback(&info, self) {
                    warn!(transaction = %self.id(), error = %post, "post rollback after failed commit");
                }
                Err(err)
            }
        }
    }

    /// Discards the transaction and notifies the chain.
    ///
    /// # Errors
    ///
    /// Returns an error once the transaction finished, or the backend's or
    /// `post_rollback`'s error.
    pub fn rollback(&self) -> DsResult<()> {
        self.ensure_active()?;
        *self.inner.state.lock() = TransactionState::RolledBack;
        let rolled_back = self.inner.raw.rollback(&self.inner.context);
        debug!(transaction = %self.id(), "transaction rolled back");
        let info = self.info();
        info.next.post_rollback(&info, self)?;
        rolled_back
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_storage::embedded::EmbeddedBackend;
    use dsclient_storage::{ClientOptions, Engine};

    fn client() -> Client {
        Client::new(
            Arc::new(EmbeddedBackend::new(Arc::new(Engine::new()))),
            ClientOptions::default(),
        )
    }

    fn named(name: &str) -> PropertyList {
        let mut props = PropertyList::new();
        props.push_value("Name", name, false);
        props
    }

    #[test]
    fn commit_resolves_pending_keys() {
        let ctx = Context::background();
        let client = client();
        let tx = client.new_transaction(&ctx).unwrap();
        let pending = tx
            .put(&client.incomplete_key("Data", None), &named("a"))
            .unwrap();
        assert!(pending.incomplete());

        let commit = tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        let key = commit.key(&pending).unwrap();

        let mut loaded = PropertyList::new();
        client.get(&ctx, &key, &mut loaded).unwrap();
        assert_eq!(loaded, named("a"));
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let ctx = Context::background();
        let client = client();
        let key = client.name_key("Data", "k", None);
        let tx = client.new_transaction(&ctx).unwrap();
        tx.put(&key, &named("staged")).unwrap();

        let err = client.get(&ctx, &key, &mut PropertyList::new()).unwrap_err();
        assert_eq!(err, DsError::NoSuchEntity);
        tx.commit().unwrap();
        client.get(&ctx, &key, &mut PropertyList::new()).unwrap();
    }

    #[test]
    fn finished_transactions_reject_operations() {
        let ctx = Context::background();
        let client = client();
        let tx = client.new_transaction(&ctx).unwrap();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let key = client.id_key("Data", 1, None);
        assert!(matches!(
            tx.put(&key, &named("late")),
            Err(DsError::InvalidOperation { .. })
        ));
        assert!(matches!(tx.commit(), Err(DsError::InvalidOperation { .. })));
        assert!(matches!(tx.rollback(), Err(DsError::InvalidOperation { .. })));
    }

    #[test]
    fn conflicting_commit_fails() {
        let ctx = Context::background();
        let client = client();
        let key = client.id_key("Data", 1, None);
        client.put(&ctx, &key, &named("v1")).unwrap();

        let tx = client.new_transaction(&ctx).unwrap();
        tx.get(&key, &mut PropertyList::new()).unwrap();
        client.put(&ctx, &key, &named("v2")).unwrap();
        tx.put(&key, &named("mine")).unwrap();

        assert_eq!(tx.commit().unwrap_err(), DsError::ConcurrentTransaction);
        assert_eq!(tx.state(), TransactionState::Failed);
    }

    #[test]
    fn run_in_transaction_retries_contention() {
        let ctx = Context::background();
        let client = client();
        let key = client.id_key("Counter", 1, None);
        client.put(&ctx, &key, &named("0")).unwrap();

        let mut attempts = 0;
        client
            .run_in_transaction(&ctx, |tx| {
                attempts += 1;
                tx.get(&key, &mut PropertyList::new())?;
                if attempts == 1 {
                    client.put(&ctx, &key, &named("interleaved"))?;
                }
                tx.put(&key, &named("done"))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(attempts, 2);

        let mut loaded = PropertyList::new();
        client.get(&ctx, &key, &mut loaded).unwrap();
        assert_eq!(loaded, named("done"));
    }

    #[test]
    fn run_in_transaction_gives_up_after_attempts() {
        let ctx = Context::background();
        let client = client();
        let key = client.id_key("Counter", 1, None);
        client.put(&ctx, &key, &named("0")).unwrap();

        let mut attempts = 0;
        let err = client
            .run_in_transaction(&ctx, |tx| {
                attempts += 1;
                tx.get(&key, &mut PropertyList::new())?;
                client.put(&ctx, &key, &named("always"))?;
                tx.put(&key, &named("never"))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, DsError::ConcurrentTransaction);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn run_in_transaction_rolls_back_on_error() {
        let ctx = Context::background();
        let client = client();
        let key = client.id_key("Data", 7, None);
        let err = client
            .run_in_transaction(&ctx, |tx| {
                tx.put(&key, &named("discarded"))?;
                Err(DsError::invalid_argument("stop"))
            })
            .unwrap_err();
        assert!(matches!(err, DsError::InvalidArgument { .. }));
        assert_eq!(
            client.get(&ctx, &key, &mut PropertyList::new()).unwrap_err(),
            DsError::NoSuchEntity
        );
    }

    #[test]
    fn queries_in_a_transaction_see_committed_rows() {
        let ctx = Context::background();
        let client = client();
        let group = client.id_key("Group", 1, None);
        let keys: Vec<Key> = (1..=3)
            .map(|id| client.id_key("Data", id, Some(&group)))
            .collect();
        let values: Vec<PropertyList> = (1..=3).map(|id| named(&format!("#{id}"))).collect();
        client.put_multi(&ctx, &keys, &values).unwrap();

        let tx = client.new_transaction(&ctx).unwrap();
        let query = client.new_query("Data").ancestor(&group);
        assert_eq!(tx.count(&query).unwrap(), 3);
        let mut rows: Vec<PropertyList> = Vec::new();
        let found = tx.get_all(&query.filter("Name >", "#1"), &mut rows).unwrap();
        assert_eq!(found, keys[1..].to_vec());
        assert!(matches!(
            tx.count(&client.new_query("Data")),
            Err(DsError::InvalidArgument { .. })
        ));
        tx.rollback().unwrap();
    }
}
