//! Error taxonomy shared by every dsclient crate.
//!
//! Backend adapters translate their native failures into [`DsError`] at the
//! edge; above the adapters only these variants are observed. Sentinels are
//! compared by variant, never by message text.

use std::fmt;
use thiserror::Error;

/// Result type for datastore operations.
pub type DsResult<T> = Result<T, DsError>;

/// Status codes reported by remote backends.
///
/// The codes follow the gRPC canonical set that Datastore services use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unknown failure.
    Unknown,
    /// The request was malformed.
    InvalidArgument,
    /// The deadline expired before the operation completed.
    DeadlineExceeded,
    /// A requested resource was not found.
    NotFound,
    /// The resource already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or rate limit was exhausted.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, typically because of contention.
    Aborted,
    /// An internal invariant was broken on the service side.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// The request carried no valid credentials.
    Unauthenticated,
}

impl ErrorCode {
    /// Returns the canonical upper-case name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Returns true when a failed call with this code may succeed if reissued.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::DeadlineExceeded | Self::Internal | Self::ResourceExhausted
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The codec could not map a property onto a record field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("datastore: cannot load field {field_name:?} into a {struct_type:?}: {reason}")]
pub struct FieldMismatch {
    /// Name of the record type being loaded.
    pub struct_type: String,
    /// Name of the property that could not be mapped.
    pub field_name: String,
    /// Why the mapping failed.
    pub reason: String,
}

impl FieldMismatch {
    /// Creates a field mismatch error.
    pub fn new(
        struct_type: impl Into<String>,
        field_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            struct_type: struct_type.into(),
            field_name: field_name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur in datastore operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DsError {
    /// The entity requested by a get does not exist.
    #[error("datastore: no such entity")]
    NoSuchEntity,

    /// A commit failed because another writer touched the same entities.
    #[error("datastore: concurrent transaction")]
    ConcurrentTransaction,

    /// The load target cannot hold the received data.
    #[error("datastore: invalid entity type")]
    InvalidEntityType,

    /// The key is malformed or not usable for the operation.
    #[error("datastore: invalid key")]
    InvalidKey,

    /// A property could not be mapped onto a record field.
    #[error(transparent)]
    FieldMismatch(#[from] FieldMismatch),

    /// Index-aligned errors of a multi-key operation.
    #[error("{0}")]
    Multi(MultiError),

    /// The iterator has no more results.
    #[error("datastore: no more items in iterator")]
    Done,

    /// The ambient context was canceled.
    #[error("context canceled")]
    Canceled,

    /// The ambient context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A record schema carries an invalid tag.
    #[error("datastore: invalid tag on field {field:?} of {struct_type:?}: {message}")]
    InvalidTag {
        /// Name of the record type.
        struct_type: String,
        /// Name of the offending field.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// A value cannot be stored (out of range time, invalid geo point, ...).
    #[error("datastore: invalid value: {message}")]
    InvalidValue {
        /// Description of the problem.
        message: String,
    },

    /// The arguments of a call are inconsistent.
    #[error("datastore: invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The operation is not permitted in the current state.
    #[error("datastore: invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A backend reported a failure that has no dedicated sentinel.
    #[error("datastore: backend error ({code}): {message}")]
    Backend {
        /// Status code reported by the backend.
        code: ErrorCode,
        /// Backend supplied message.
        message: String,
    },

    /// The client configuration is incomplete or inconsistent.
    #[error("datastore: configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },
}

impl DsError {
    /// Creates a field mismatch error.
    pub fn field_mismatch(
        struct_type: impl Into<String>,
        field_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::FieldMismatch(FieldMismatch::new(struct_type, field_name, reason))
    }

    /// Creates an invalid tag error.
    pub fn invalid_tag(
        struct_type: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidTag {
            struct_type: struct_type.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true for [`DsError::NoSuchEntity`].
    #[must_use]
    pub fn is_no_such_entity(&self) -> bool {
        matches!(self, Self::NoSuchEntity)
    }

    /// Returns true for the iterator termination sentinel.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true for field mismatch errors.
    #[must_use]
    pub fn is_field_mismatch(&self) -> bool {
        matches!(self, Self::FieldMismatch(_))
    }

    /// Returns true when reissuing the call that produced this error may succeed.
    ///
    /// A multi error is retriable when any of its entries is.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Backend { code, .. } => code.is_retriable(),
            Self::Multi(errs) => errs.iter().flatten().any(DsError::is_retriable),
            _ => false,
        }
    }

    /// Unwraps a single-entry multi error into its element.
    ///
    /// Single-item operations call the multi-item path with one key; the
    /// caller must never observe a `MultiError` of length one.
    #[must_use]
    pub fn unwrap_single(self) -> Self {
        match self {
            Self::Multi(errs) if errs.len() == 1 => match errs.into_inner().pop().flatten() {
                Some(err) => err,
                None => Self::invalid_operation("empty multi error"),
            },
            other => other,
        }
    }
}

/// An index-aligned list of per-item errors.
///
/// Each entry mirrors one element of the input key list of a multi-key
/// operation and is either `None` or the error for that element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiError(Vec<Option<DsError>>);

impl MultiError {
    /// Creates a multi error of `len` empty entries.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// Creates a multi error where every entry holds a copy of `err`.
    #[must_use]
    pub fn broadcast(len: usize, err: &DsError) -> Self {
        Self(vec![Some(err.clone()); len])
    }

    /// Wraps an existing list of entries.
    #[must_use]
    pub fn from_vec(errs: Vec<Option<DsError>>) -> Self {
        Self(errs)
    }

    /// Number of entries (equal to the length of the input key list).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the error at `index`, if any.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&DsError> {
        self.0.get(index).and_then(Option::as_ref)
    }

    /// Sets the error at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, err: DsError) {
        self.0[index] = Some(err);
    }

    /// Clears the error at `index`.
    pub fn clear(&mut self, index: usize) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = None;
        }
    }

    /// Returns true when at least one entry holds an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Option::is_some)
    }

    /// Number of entries holding an error.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.0.iter().filter(|e| e.is_some()).count()
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> std::slice::Iter<'_, Option<DsError>> {
        self.0.iter()
    }

    /// Appends the entries of another multi error.
    pub fn extend(&mut self, other: MultiError) {
        self.0.extend(other.0);
    }

    /// Returns the entries.
    #[must_use]
    pub fn into_inner(self) -> Vec<Option<DsError>> {
        self.0
    }

    /// Converts into `Ok(())` when empty of errors, `Err(DsError::Multi)` otherwise.
    pub fn into_result(self) -> DsResult<()> {
        if self.has_errors() {
            Err(DsError::Multi(self))
        } else {
            Ok(())
        }
    }

    /// Spreads the outcome of a multi-key call over `len` entries.
    ///
    /// A multi error of the right length is taken as is; any other error is
    /// broadcast to every entry.
    #[must_use]
    pub fn from_outcome(len: usize, outcome: &DsResult<()>) -> Self {
        match outcome {
            Ok(()) => Self::new(len),
            Err(DsError::Multi(errs)) if errs.len() == len => errs.clone(),
            Err(err) => Self::broadcast(len, err),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.0.iter().flatten();
        let Some(first) = errors.next() else {
            return f.write_str("(0 errors)");
        };
        match errors.count() {
            0 => write!(f, "{first}"),
            1 => write!(f, "{first} (and 1 other error)"),
            n => write!(f, "{first} (and {n} other errors)"),
        }
    }
}

impl std::error::Error for MultiError {}

impl std::ops::Index<usize> for MultiError {
    type Output = Option<DsError>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IntoIterator for MultiError {
    type Item = Option<DsError>;
    type IntoIter = std::vec::IntoIter<Option<DsError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MultiError {
    type Item = &'a Option<DsError>;
    type IntoIter = std::slice::Iter<'a, Option<DsError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<Option<DsError>>> for MultiError {
    fn from(errs: Vec<Option<DsError>>) -> Self {
        Self(errs)
    }
}

impl From<MultiError> for DsError {
    fn from(errs: MultiError) -> Self {
        Self::Multi(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_display_counts_other_errors() {
        let mut errs = MultiError::new(4);
        assert_eq!(errs.to_string(), "(0 errors)");

        errs.set(1, DsError::NoSuchEntity);
        assert_eq!(errs.to_string(), "datastore: no such entity");

        errs.set(2, DsError::InvalidKey);
        assert_eq!(
            errs.to_string(),
            "datastore: no such entity (and 1 other error)"
        );

        errs.set(3, DsError::InvalidKey);
        assert_eq!(
            errs.to_string(),
            "datastore: no such entity (and 2 other errors)"
        );
    }

    #[test]
    fn unwrap_single_returns_element() {
        let err = DsError::Multi(MultiError::from_vec(vec![Some(DsError::NoSuchEntity)]));
        assert_eq!(err.unwrap_single(), DsError::NoSuchEntity);

        let wide = DsError::Multi(MultiError::new(2));
        assert!(matches!(wide.unwrap_single(), DsError::Multi(_)));
    }

    #[test]
    fn into_result_only_errs_with_entries() {
        assert!(MultiError::new(3).into_result().is_ok());

        let mut errs = MultiError::new(3);
        errs.set(0, DsError::InvalidKey);
        assert!(matches!(errs.into_result(), Err(DsError::Multi(_))));
    }

    #[test]
    fn from_outcome_broadcasts_plain_errors() {
        let spread = MultiError::from_outcome(3, &Err(DsError::InvalidKey));
        assert_eq!(spread.error_count(), 3);

        let mut aligned = MultiError::new(2);
        aligned.set(1, DsError::NoSuchEntity);
        let kept = MultiError::from_outcome(2, &Err(DsError::Multi(aligned.clone())));
        assert_eq!(kept, aligned);
    }

    #[test]
    fn retriable_follows_codes() {
        assert!(DsError::backend(ErrorCode::Unavailable, "down").is_retriable());
        assert!(!DsError::backend(ErrorCode::InvalidArgument, "bad").is_retriable());
        assert!(!DsError::NoSuchEntity.is_retriable());

        let mut errs = MultiError::new(2);
        errs.set(0, DsError::NoSuchEntity);
        errs.set(1, DsError::backend(ErrorCode::Internal, "boom"));
        assert!(DsError::Multi(errs).is_retriable());
    }

    #[test]
    fn field_mismatch_message() {
        let err = DsError::field_mismatch("User", "Age", "no such struct field");
        assert_eq!(
            err.to_string(),
            "datastore: cannot load field \"Age\" into a \"User\": no such struct field"
        );
    }
}
