//! Engine transaction state.

use crate::error::{EngineError, EngineResult};
use dsclient_codec::{Key, PropertyList, TransactionId};
use std::collections::HashSet;

/// State of an engine transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction accepts operations.
    Active,
    /// The transaction has been committed.
    Committed,
    /// The transaction has been aborted or lost a conflict.
    Aborted,
}

impl TransactionState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// A write staged by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Insert or replace an entity. `slot` numbers the transaction's puts.
    Put {
        /// Target key, possibly incomplete.
        key: Key,
        /// Entity properties.
        properties: PropertyList,
        /// Position among the transaction's puts.
        slot: usize,
    },
    /// Remove an entity.
    Delete {
        /// Target key.
        key: Key,
    },
}

impl PendingWrite {
    /// The key the write targets.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// An optimistic engine transaction.
///
/// Writes are staged in order and applied at commit. Reads see committed
/// state, never the transaction's own staged writes. The commit fails with
/// [`EngineError::Conflict`] if any key read or written was committed by
/// someone else after the transaction began.
#[derive(Debug)]
pub struct EngineTransaction {
    id: TransactionId,
    snapshot_seq: u64,
    state: TransactionState,
    blind: bool,
    writes: Vec<PendingWrite>,
    puts: usize,
    reads: HashSet<Key>,
}

impl EngineTransaction {
    pub(crate) fn new(snapshot_seq: u64, blind: bool) -> Self {
        Self {
            id: TransactionId::next(),
            snapshot_seq,
            state: TransactionState::Active,
            blind,
            writes: Vec::new(),
            puts: 0,
            reads: HashSet::new(),
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the committed sequence the transaction started from.
    #[must_use]
    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction still accepts operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Blind transactions skip conflict detection; they back
    /// non-transactional writes.
    #[must_use]
    pub fn is_blind(&self) -> bool {
        self.blind
    }

    /// Stages a put and returns its slot.
    ///
    /// # Errors
    ///
    /// Fails once the transaction finished.
    pub fn put(&mut self, key: Key, properties: PropertyList) -> EngineResult<usize> {
        self.ensure_active()?;
        let slot = self.puts;
        self.puts += 1;
        self.writes.push(PendingWrite::Put {
            key,
            properties,
            slot,
        });
        Ok(slot)
    }

    /// Stages a delete.
    ///
    /// # Errors
    ///
    /// Fails once the transaction finished.
    pub fn delete(&mut self, key: Key) -> EngineResult<()> {
        self.ensure_active()?;
        self.writes.push(PendingWrite::Delete { key });
        Ok(())
    }

    /// Records a read for conflict detection.
    pub fn record_read(&mut self, key: &Key) {
        if !self.blind {
            self.reads.insert(key.clone());
        }
    }

    /// Returns the staged writes in order.
    pub fn pending_writes(&self) -> impl Iterator<Item = &PendingWrite> {
        self.writes.iter()
    }

    /// Returns the number of staged writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Returns the number of staged puts.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts
    }

    /// Returns the read set.
    pub fn read_set(&self) -> impl Iterator<Item = &Key> {
        self.reads.iter()
    }

    pub(crate) fn take_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    /// Ensures the transaction is active.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransactionNotActive`] naming the terminal state.
    pub fn ensure_active(&self) -> EngineResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(EngineError::TransactionNotActive {
                transaction: self.id.as_u64(),
                state: state.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_txn() -> EngineTransaction {
        EngineTransaction::new(0, false)
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = create_txn();
        assert!(txn.is_active());
        assert_eq!(txn.state(), TransactionState::Active);
    }

    #[test]
    fn puts_are_numbered_in_order() {
        let mut txn = create_txn();
        let a = txn
            .put(Key::incomplete_key("Data", None), PropertyList::new())
            .unwrap();
        txn.delete(Key::id_key("Data", 3, None)).unwrap();
        let b = txn
            .put(Key::id_key("Data", 4, None), PropertyList::new())
            .unwrap();

        assert_eq!((a, b), (0, 1));
        assert_eq!(txn.write_count(), 3);
        assert_eq!(txn.put_count(), 2);
    }

    #[test]
    fn finished_transaction_rejects_writes() {
        let mut txn = create_txn();
        txn.mark_committed();

        let err = txn.delete(Key::id_key("Data", 1, None)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransactionNotActive {
                state: "committed",
                ..
            }
        ));
    }

    #[test]
    fn blind_transaction_keeps_no_read_set() {
        let mut txn = EngineTransaction::new(0, true);
        txn.record_read(&Key::id_key("Data", 1, None));
        assert_eq!(txn.read_set().count(), 0);
    }
}
