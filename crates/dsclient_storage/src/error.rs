//! Errors raised by the in-process engine.

use dsclient_codec::DsError;
use dsclient_codec::ErrorCode;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the engine.
///
/// These never reach application code: each adapter translates them at its
/// edge, either straight into [`DsError`] (embedded) or into wire status
/// codes (cloud loopback).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The key cannot be used for the operation.
    #[error("invalid key {key}: {reason}")]
    InvalidKey {
        /// The offending key in path form.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// Another writer committed a key this transaction touched.
    #[error("transaction {transaction} conflicts on {key}")]
    Conflict {
        /// The conflicting transaction.
        transaction: u64,
        /// The contended key in path form.
        key: String,
    },

    /// The transaction was already committed or aborted.
    #[error("transaction {transaction} is not active: {state}")]
    TransactionNotActive {
        /// The finished transaction.
        transaction: u64,
        /// Its terminal state.
        state: &'static str,
    },

    /// The query cannot be evaluated.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A cursor does not decode to a stream position.
    #[error("invalid cursor")]
    InvalidCursor,

    /// The engine was closed.
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Creates an invalid key error.
    pub fn invalid_key(key: &dsclient_codec::Key, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }
}

impl From<EngineError> for DsError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidKey { .. } => DsError::InvalidKey,
            EngineError::Conflict { .. } => DsError::ConcurrentTransaction,
            EngineError::TransactionNotActive { .. } => DsError::invalid_operation(err.to_string()),
            EngineError::InvalidQuery(_) | EngineError::InvalidCursor => {
                DsError::invalid_argument(err.to_string())
            }
            EngineError::Closed => DsError::backend(ErrorCode::Unavailable, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::Key;

    #[test]
    fn translation_keeps_sentinels() {
        let key = Key::id_key("Data", 1, None);
        assert_eq!(
            DsError::from(EngineError::invalid_key(&key, "incomplete")),
            DsError::InvalidKey
        );
        assert_eq!(
            DsError::from(EngineError::Conflict {
                transaction: 7,
                key: key.to_string(),
            }),
            DsError::ConcurrentTransaction
        );
        assert!(matches!(
            DsError::from(EngineError::Closed),
            DsError::Backend {
                code: ErrorCode::Unavailable,
                ..
            }
        ));
    }

    #[test]
    fn messages_name_the_key() {
        let key = Key::name_key("Data", "a", None);
        let err = EngineError::invalid_key(&key, "reserved kind");
        assert_eq!(err.to_string(), "invalid key /Data,a: reserved kind");
    }
}
