//! The remote service contract and its status codes.

use super::wire::{
    AllocateIdsRequest, AllocateIdsResponse, BeginTransactionRequest, BeginTransactionResponse,
    CommitRequest, CommitResponse, LookupRequest, LookupResponse, RollbackRequest,
    RunQueryRequest, RunQueryResponse,
};
use dsclient_codec::{Context, DsError, ErrorCode};
use std::fmt;
use thiserror::Error;

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct Status {
    /// Status code.
    pub code: ErrorCode,
    /// Server message.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An `InvalidArgument` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// An `Aborted` status.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    /// An `Unauthenticated` status.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }
}

/// Message prefix the server uses for key problems.
pub const INVALID_KEY_PREFIX: &str = "invalid key";

impl From<Status> for DsError {
    fn from(status: Status) -> Self {
        match status.code {
            ErrorCode::Aborted => DsError::ConcurrentTransaction,
            ErrorCode::InvalidArgument if status.message.starts_with(INVALID_KEY_PREFIX) => {
                DsError::InvalidKey
            }
            code => DsError::Backend {
                code,
                message: status.message,
            },
        }
    }
}

/// Per-call data handed to the service.
#[derive(Debug, Clone)]
pub struct Call<'a> {
    /// Ambient context of the call.
    pub ctx: &'a Context,
    /// Bearer token, when a token source is configured.
    pub token: Option<String>,
}

/// The remote datastore service.
///
/// Implementations are transports; they do not retry. Retrying is the
/// business of middlewares.
pub trait RemoteService: Send + Sync + fmt::Debug {
    /// Looks up entities by key.
    ///
    /// # Errors
    ///
    /// Returns the call's failure status.
    fn lookup(&self, call: &Call<'_>, req: LookupRequest) -> Result<LookupResponse, Status>;

    /// Runs a query, returning one page.
    ///
    /// # Errors
    ///
    /// Returns the call's failure status.
    fn run_query(&self, call: &Call<'_>, req: RunQueryRequest) -> Result<RunQueryResponse, Status>;

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns the call's failure status.
    fn begin_transaction(
        &self,
        call: &Call<'_>,
        req: BeginTransactionRequest,
    ) -> Result<BeginTransactionResponse, Status>;

    /// Commits mutations.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` when a transaction lost a conflict.
    fn commit(&self, call: &Call<'_>, req: CommitRequest) -> Result<CommitResponse, Status>;

    /// Rolls a transaction back.
    ///
    /// # Errors
    ///
    /// Returns the call's failure status.
    fn rollback(&self, call: &Call<'_>, req: RollbackRequest) -> Result<(), Status>;

    /// Allocates ids for incomplete keys.
    ///
    /// # Errors
    ///
    /// Returns the call's failure status.
    fn allocate_ids(&self, call: &Call<'_>, req: AllocateIdsRequest) -> Result<AllocateIdsResponse, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_keeps_sentinels() {
        assert_eq!(
            DsError::from(Status::aborted("too much contention")),
            DsError::ConcurrentTransaction
        );
        assert_eq!(
            DsError::from(Status::invalid_argument("invalid key /Data,0: incomplete key")),
            DsError::InvalidKey
        );
        assert_eq!(
            DsError::from(Status::invalid_argument("invalid cursor")),
            DsError::Backend {
                code: ErrorCode::InvalidArgument,
                message: "invalid cursor".to_string(),
            }
        );
    }

    #[test]
    fn unavailable_stays_retriable() {
        let err = DsError::from(Status::new(ErrorCode::Unavailable, "try later"));
        assert!(err.is_retriable());
    }
}
