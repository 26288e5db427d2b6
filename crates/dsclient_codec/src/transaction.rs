//! Transaction identity, pending keys and commit results.

use crate::error::{DsError, DsResult};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transaction identifier.
///
/// Identifiers increase monotonically in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A key promised by a transactional put, resolved by the transaction's commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    transaction: TransactionId,
    slot: usize,
    key: Key,
}

impl PendingKey {
    /// Creates a pending key for the put at `slot` of `transaction`.
    #[must_use]
    pub fn new(transaction: TransactionId, slot: usize, key: Key) -> Self {
        Self {
            transaction,
            slot,
            key,
        }
    }

    /// The transaction that created this pending key.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Position of the put among the transaction's puts.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The key passed to the put, possibly incomplete.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns true when the put was given an incomplete key.
    #[must_use]
    pub fn incomplete(&self) -> bool {
        self.key.incomplete()
    }
}

/// The result of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    transaction: TransactionId,
    keys: Vec<Key>,
}

impl Commit {
    /// Creates a commit whose resolved keys are indexed by pending-key slot.
    #[must_use]
    pub fn new(transaction: TransactionId, keys: Vec<Key>) -> Self {
        Self { transaction, keys }
    }

    /// The committed transaction.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Every key written by the transaction, in put order.
    #[must_use]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Resolves a pending key created in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidOperation`] when the pending key belongs to
    /// another transaction or its slot is unknown.
    pub fn key(&self, pending: &PendingKey) -> DsResult<Key> {
        if pending.transaction != self.transaction {
            return Err(DsError::invalid_operation(format!(
                "pending key of {} resolved against commit of {}",
                pending.transaction, self.transaction
            )));
        }
        self.keys.get(pending.slot).cloned().ok_or_else(|| {
            DsError::invalid_operation(format!("no put at slot {} in {}", pending.slot, self.transaction))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = TransactionId::next();
        let b = TransactionId::next();
        assert!(b > a);
    }

    #[test]
    fn commit_resolves_own_pending_keys() {
        let tx = TransactionId::next();
        let pending = PendingKey::new(tx, 1, Key::incomplete_key("K", None));
        let commit = Commit::new(
            tx,
            vec![Key::id_key("K", 1, None), Key::id_key("K", 2, None)],
        );
        assert_eq!(commit.key(&pending).unwrap(), Key::id_key("K", 2, None));
    }

    #[test]
    fn commit_rejects_foreign_pending_keys() {
        let other = PendingKey::new(TransactionId::next(), 0, Key::incomplete_key("K", None));
        let commit = Commit::new(TransactionId::next(), vec![Key::id_key("K", 1, None)]);
        assert!(matches!(
            commit.key(&other),
            Err(DsError::InvalidOperation { .. })
        ));
    }
}
