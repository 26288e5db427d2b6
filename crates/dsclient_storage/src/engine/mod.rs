//! In-process datastore engine.
//!
//! The engine is the datastore both adapters sit on: the embedded adapter
//! calls it directly, the cloud loopback service exposes it through the
//! wire model.
//!
//! ## Commit protocol
//!
//! Every commit takes the state write lock, checks for conflicts, bumps the
//! committed sequence and stamps each written key with it. Deleted keys keep
//! their stamp, so a delete racing a transaction is detected like a put.
//! Non-transactional writes run as blind transactions that skip the
//! conflict check.

mod query;
mod transaction;

pub use query::{cursor_position, position_cursor, QueryRow, QueryRows};
pub use transaction::{EngineTransaction, PendingWrite, TransactionState};

use crate::error::{EngineError, EngineResult};
use dsclient_codec::{Commit, Key, PendingKey, PropertyList, Query};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct EngineState {
    entities: BTreeMap<Key, PropertyList>,
    /// Commit sequence of the last write to each key, deletes included.
    versions: HashMap<Key, u64>,
    committed_seq: u64,
    last_id: i64,
}

impl EngineState {
    fn version(&self, key: &Key) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Picks the next id never used by any key of the same path.
    fn allocate(&mut self, key: &Key) -> Key {
        loop {
            self.last_id += 1;
            let candidate = key.with_id(self.last_id);
            if !self.versions.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

fn check_key(key: &Key, allow_incomplete: bool) -> EngineResult<()> {
    if !key.valid() {
        return Err(EngineError::invalid_key(key, "malformed key"));
    }
    if !allow_incomplete && key.incomplete() {
        return Err(EngineError::invalid_key(key, "incomplete key"));
    }
    Ok(())
}

/// The shared in-process datastore.
#[derive(Debug, Default)]
pub struct Engine {
    state: RwLock<EngineState>,
    closed: AtomicBool,
}

impl Engine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the engine; later operations fail with [`EngineError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Returns the last committed sequence.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.state.read().committed_seq
    }

    /// Returns the number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Returns true when no entity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when an entity is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.state.read().entities.contains_key(key)
    }

    /// Commit sequence of the last write to `key`, 0 if never written.
    #[must_use]
    pub fn version(&self, key: &Key) -> u64 {
        self.state.read().version(key)
    }

    /// Completes incomplete keys with fresh ids.
    ///
    /// # Errors
    ///
    /// Fails for complete or malformed keys.
    pub fn allocate_ids(&self, keys: &[Key]) -> EngineResult<Vec<Key>> {
        self.check_open()?;
        for key in keys {
            check_key(key, true)?;
            if !key.incomplete() {
                return Err(EngineError::invalid_key(key, "key is already complete"));
            }
        }
        let mut state = self.state.write();
        Ok(keys.iter().map(|key| state.allocate(key)).collect())
    }

    /// Stores entities atomically, completing incomplete keys.
    ///
    /// # Errors
    ///
    /// Fails for malformed keys; nothing is written then.
    pub fn put(&self, keys: &[Key], entities: Vec<PropertyList>) -> EngineResult<Vec<Key>> {
        let mut txn = self.begin_blind()?;
        for (key, properties) in keys.iter().zip(entities) {
            check_key(key, true)?;
            txn.put(key.clone(), properties)?;
        }
        self.commit_inner(&mut txn)
    }

    /// Reads committed entities.
    ///
    /// # Errors
    ///
    /// Fails for incomplete or malformed keys.
    pub fn get(&self, keys: &[Key]) -> EngineResult<Vec<Option<PropertyList>>> {
        self.check_open()?;
        for key in keys {
            check_key(key, false)?;
        }
        let state = self.state.read();
        Ok(keys.iter().map(|key| state.entities.get(key).cloned()).collect())
    }

    /// Deletes entities atomically. Missing entities are ignored.
    ///
    /// # Errors
    ///
    /// Fails for incomplete or malformed keys; nothing is deleted then.
    pub fn delete(&self, keys: &[Key]) -> EngineResult<()> {
        let mut txn = self.begin_blind()?;
        for key in keys {
            check_key(key, false)?;
            txn.delete(key.clone())?;
        }
        self.commit_inner(&mut txn).map(|_| ())
    }

    /// Begins an optimistic transaction.
    ///
    /// # Errors
    ///
    /// Fails once the engine is closed.
    pub fn begin(&self) -> EngineResult<EngineTransaction> {
        self.check_open()?;
        let txn = EngineTransaction::new(self.committed_seq(), false);
        trace!(transaction = %txn.id(), snapshot = txn.snapshot_seq(), "engine transaction begun");
        Ok(txn)
    }

    /// Begins a transaction that never conflicts.
    ///
    /// # Errors
    ///
    /// Fails once the engine is closed.
    pub fn begin_blind(&self) -> EngineResult<EngineTransaction> {
        self.check_open()?;
        Ok(EngineTransaction::new(self.committed_seq(), true))
    }

    /// Reads entities inside a transaction, recording them for conflict
    /// detection.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get), or the transaction is finished.
    pub fn get_in(
        &self,
        txn: &mut EngineTransaction,
        keys: &[Key],
    ) -> EngineResult<Vec<Option<PropertyList>>> {
        txn.ensure_active()?;
        let found = self.get(keys)?;
        for key in keys {
            txn.record_read(key);
        }
        Ok(found)
    }

    /// Stages puts inside a transaction.
    ///
    /// # Errors
    ///
    /// Fails for malformed keys or a finished transaction.
    pub fn put_in(
        &self,
        txn: &mut EngineTransaction,
        keys: &[Key],
        entities: Vec<PropertyList>,
    ) -> EngineResult<Vec<PendingKey>> {
        for key in keys {
            check_key(key, true)?;
        }
        keys.iter()
            .zip(entities)
            .map(|(key, properties)| {
                let slot = txn.put(key.clone(), properties)?;
                Ok(PendingKey::new(txn.id(), slot, key.clone()))
            })
            .collect()
    }

    /// Stages deletes inside a transaction.
    ///
    /// # Errors
    ///
    /// Fails for incomplete keys or a finished transaction.
    pub fn delete_in(&self, txn: &mut EngineTransaction, keys: &[Key]) -> EngineResult<()> {
        for key in keys {
            check_key(key, false)?;
        }
        keys.iter().try_for_each(|key| txn.delete(key.clone()))
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] if a key the transaction touched was
    /// committed by someone else since it began; the transaction is aborted.
    pub fn commit(&self, txn: &mut EngineTransaction) -> EngineResult<Commit> {
        let keys = self.commit_inner(txn)?;
        Ok(Commit::new(txn.id(), keys))
    }

    fn commit_inner(&self, txn: &mut EngineTransaction) -> EngineResult<Vec<Key>> {
        txn.ensure_active()?;
        self.check_open()?;

        let mut state = self.state.write();
        if !txn.is_blind() {
            let contended = txn
                .read_set()
                .chain(txn.pending_writes().map(PendingWrite::key))
                .find(|key| !key.incomplete() && state.version(key) > txn.snapshot_seq())
                .cloned();
            if let Some(key) = contended {
                txn.mark_aborted();
                debug!(transaction = %txn.id(), %key, "engine transaction lost a conflict");
                return Err(EngineError::Conflict {
                    transaction: txn.id().as_u64(),
                    key: key.to_string(),
                });
            }
        }

        state.committed_seq += 1;
        let seq = state.committed_seq;
        let mut resolved: Vec<Option<Key>> = vec![None; txn.put_count()];
        for write in txn.take_writes() {
            match write {
                PendingWrite::Put {
                    key,
                    properties,
                    slot,
                } => {
                    let key = if key.incomplete() {
                        state.allocate(&key)
                    } else {
                        key
                    };
                    state.versions.insert(key.clone(), seq);
                    state.entities.insert(key.clone(), properties);
                    resolved[slot] = Some(key);
                }
                PendingWrite::Delete { key } => {
                    state.entities.remove(&key);
                    state.versions.insert(key, seq);
                }
            }
        }
        txn.mark_committed();
        trace!(transaction = %txn.id(), seq, "engine transaction committed");
        Ok(resolved.into_iter().flatten().collect())
    }

    /// Aborts a transaction, discarding its staged writes.
    ///
    /// # Errors
    ///
    /// Fails when the transaction already finished.
    pub fn rollback(&self, txn: &mut EngineTransaction) -> EngineResult<()> {
        txn.ensure_active()?;
        txn.take_writes();
        txn.mark_aborted();
        trace!(transaction = %txn.id(), "engine transaction rolled back");
        Ok(())
    }

    /// Evaluates a query against committed state.
    ///
    /// # Errors
    ///
    /// Fails for invalid queries or foreign cursors.
    pub fn run(&self, query: &Query) -> EngineResult<QueryRows> {
        self.check_open()?;
        let state = self.state.read();
        query::evaluate(state.entities.iter(), query)
    }

    /// Evaluates a query inside a transaction, recording the returned keys
    /// for conflict detection.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run), or the transaction is finished.
    pub fn run_in(&self, txn: &mut EngineTransaction, query: &Query) -> EngineResult<QueryRows> {
        txn.ensure_active()?;
        let rows = self.run(query)?;
        for row in &rows.rows {
            txn.record_read(&row.key);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(name: &str) -> PropertyList {
        let mut props = PropertyList::new();
        props.push_value("Name", name, false);
        props
    }

    #[test]
    fn put_completes_keys_without_collisions() {
        let engine = Engine::new();
        engine
            .put(&[Key::id_key("Data", 1, None)], vec![props("one")])
            .unwrap();

        let keys = engine
            .put(
                &[Key::incomplete_key("Data", None), Key::incomplete_key("Data", None)],
                vec![props("a"), props("b")],
            )
            .unwrap();

        assert_eq!(keys[0].id(), 2);
        assert_eq!(keys[1].id(), 3);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn get_returns_missing_as_none() {
        let engine = Engine::new();
        let key = Key::name_key("Data", "a", None);
        engine.put(&[key.clone()], vec![props("a")]).unwrap();

        let found = engine
            .get(&[key, Key::name_key("Data", "b", None)])
            .unwrap();
        assert_eq!(found, vec![Some(props("a")), None]);
    }

    #[test]
    fn get_rejects_incomplete_keys() {
        let engine = Engine::new();
        let err = engine.get(&[Key::incomplete_key("Data", None)]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidKey { .. }));
    }

    #[test]
    fn transaction_writes_are_deferred() {
        let engine = Engine::new();
        let key = Key::id_key("Data", 5, None);
        let mut txn = engine.begin().unwrap();
        engine.put_in(&mut txn, &[key.clone()], vec![props("x")]).unwrap();

        assert!(!engine.contains(&key));
        engine.commit(&mut txn).unwrap();
        assert!(engine.contains(&key));
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn commit_resolves_pending_keys_by_slot() {
        let engine = Engine::new();
        let mut txn = engine.begin().unwrap();
        let pending = engine
            .put_in(
                &mut txn,
                &[Key::incomplete_key("Data", None), Key::name_key("Data", "n", None)],
                vec![props("a"), props("b")],
            )
            .unwrap();
        let commit = engine.commit(&mut txn).unwrap();

        let first = commit.key(&pending[0]).unwrap();
        assert!(!first.incomplete());
        assert_eq!(commit.key(&pending[1]).unwrap().name(), "n");
    }

    #[test]
    fn conflicting_writer_aborts_transaction() {
        let engine = Engine::new();
        let key = Key::id_key("Data", 1, None);
        engine.put(&[key.clone()], vec![props("v1")]).unwrap();

        let mut txn = engine.begin().unwrap();
        engine.get_in(&mut txn, &[key.clone()]).unwrap();
        engine.put(&[key.clone()], vec![props("v2")]).unwrap();
        engine.put_in(&mut txn, &[key.clone()], vec![props("v3")]).unwrap();

        let err = engine.commit(&mut txn).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(engine.get(&[key]).unwrap()[0], Some(props("v2")));
    }

    #[test]
    fn delete_racing_a_transaction_conflicts() {
        let engine = Engine::new();
        let key = Key::id_key("Data", 1, None);
        engine.put(&[key.clone()], vec![props("v1")]).unwrap();

        let mut txn = engine.begin().unwrap();
        engine.get_in(&mut txn, &[key.clone()]).unwrap();
        engine.delete(&[key]).unwrap();

        assert!(matches!(
            engine.commit(&mut txn),
            Err(EngineError::Conflict { .. })
        ));
    }

    #[test]
    fn rollback_discards_writes() {
        let engine = Engine::new();
        let key = Key::id_key("Data", 9, None);
        let mut txn = engine.begin().unwrap();
        engine.put_in(&mut txn, &[key.clone()], vec![props("x")]).unwrap();
        engine.rollback(&mut txn).unwrap();

        assert!(!engine.contains(&key));
        assert!(matches!(
            engine.commit(&mut txn),
            Err(EngineError::TransactionNotActive { state: "aborted", .. })
        ));
    }

    #[test]
    fn allocation_skips_deleted_ids() {
        let engine = Engine::new();
        engine
            .put(&[Key::id_key("Data", 1, None)], vec![props("a")])
            .unwrap();
        engine.delete(&[Key::id_key("Data", 1, None)]).unwrap();

        let keys = engine.allocate_ids(&[Key::incomplete_key("Data", None)]).unwrap();
        assert_eq!(keys[0].id(), 2);
    }

    #[test]
    fn closed_engine_refuses_work() {
        let engine = Engine::new();
        engine.close();
        assert_eq!(engine.run(&Query::new("Data")).unwrap_err(), EngineError::Closed);
    }

    proptest::proptest! {
        #[test]
        fn put_get_delete_agree(
            rows in proptest::collection::btree_map(1i64..10_000, "[a-z]{0,12}", 1..20),
            drop_every in 1usize..4,
        ) {
            let engine = Engine::new();
            let keys: Vec<Key> = rows.keys().map(|id| Key::id_key("Data", *id, None)).collect();
            let stored = engine
                .put(&keys, rows.values().map(|name| props(name)).collect())
                .unwrap();
            proptest::prop_assert_eq!(&stored, &keys);

            let loaded = engine.get(&keys).unwrap();
            for (found, name) in loaded.iter().zip(rows.values()) {
                proptest::prop_assert_eq!(found.as_ref(), Some(&props(name)));
            }

            let dropped: Vec<Key> = keys.iter().step_by(drop_every).cloned().collect();
            engine.delete(&dropped).unwrap();
            proptest::prop_assert_eq!(engine.len(), keys.len() - dropped.len());
            for (i, found) in engine.get(&keys).unwrap().into_iter().enumerate() {
                proptest::prop_assert_eq!(found.is_none(), i % drop_every == 0);
            }
        }
    }
}
