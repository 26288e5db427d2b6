//! The bottom-of-chain backend contract.

use dsclient_codec::{
    Commit, Context, Cursor, DsError, DsResult, Key, PendingKey, PropertyList, Query,
    TransactionId,
};
use std::any::Any;

/// A concrete datastore implementing the full operation set.
///
/// Adapters translate their native failures into [`DsError`] before
/// returning; nothing above this trait branches on backend identity.
///
/// # Invariants
///
/// - Every multi-key operation either fails as a whole or returns a
///   [`DsError::Multi`] whose length equals the input key count.
/// - `put_multi` returns one complete key per input key, in input order.
/// - `get_multi` leaves `dst[i]` untouched when entry `i` failed.
///
/// # Thread Safety
///
/// Backends are shared by every clone of a client and must be `Send + Sync`.
pub trait Backend: Send + Sync {
    /// Short identifier of the adapter, for logging.
    fn name(&self) -> &'static str;

    /// Allocates complete keys for incomplete keys.
    ///
    /// # Errors
    ///
    /// Returns a multi-error with [`DsError::InvalidKey`] for complete or
    /// malformed inputs.
    fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> DsResult<Vec<Key>>;

    /// Stores entities, returning their complete keys.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error for invalid keys.
    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Key>>;

    /// Loads entities into `dst`.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error; missing entities are
    /// [`DsError::NoSuchEntity`].
    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()>;

    /// Deletes entities. Deleting a missing entity is not an error.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error for invalid keys.
    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()>;

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start one.
    fn new_transaction(&self, ctx: &Context) -> DsResult<Box<dyn BackendTransaction>>;

    /// Runs a query outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid.
    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>>;

    /// Runs a query to completion, appending every row to `dst`.
    ///
    /// # Errors
    ///
    /// Returns the first query or iteration error.
    fn get_all(&self, ctx: &Context, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        let mut iter = self.run(ctx, query)?;
        drain(ctx, iter.as_mut(), dst)
    }

    /// Counts the rows a query yields.
    ///
    /// # Errors
    ///
    /// Returns the first query or iteration error.
    fn count(&self, ctx: &Context, query: &Query) -> DsResult<usize> {
        let mut iter = if query.projection().is_empty() {
            self.run(ctx, &query.clone().keys_only())?
        } else {
            self.run(ctx, query)?
        };
        count_rows(ctx, iter.as_mut())
    }

    /// Encodes a key to its opaque string form.
    fn encode_key(&self, key: &Key) -> String {
        key.encode()
    }

    /// Decodes an opaque key string.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed input.
    fn decode_key(&self, encoded: &str) -> DsResult<Key> {
        Key::decode(encoded)
    }

    /// Releases backend resources. Later calls fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend was already closed.
    fn close(&self) -> DsResult<()>;
}

/// A backend transaction.
///
/// Writes are deferred until [`commit`](Self::commit). Implementations guard
/// their state internally; callers serialise use of one transaction.
pub trait BackendTransaction: Send + Sync {
    /// The transaction identity carried by its pending keys and commit.
    fn id(&self) -> TransactionId;

    /// Queues puts, returning one pending key per input key.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error for invalid keys, or
    /// [`DsError::InvalidOperation`] once finished.
    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<PendingKey>>;

    /// Reads entities as of the transaction's snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::get_multi`].
    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()>;

    /// Queues deletes.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::delete_multi`].
    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()>;

    /// Runs an ancestor query inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid.
    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>>;

    /// Applies the queued writes atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::ConcurrentTransaction`] when another writer won.
    fn commit(&self, ctx: &Context) -> DsResult<Commit>;

    /// Discards the queued writes.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidOperation`] once finished.
    fn rollback(&self, ctx: &Context) -> DsResult<()>;
}

/// A backend query result stream.
pub trait RawIterator: Send {
    /// Loads the next row into `dst` and returns its key.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::Done`] once the stream is exhausted.
    fn next(&mut self, ctx: &Context, dst: &mut PropertyList) -> DsResult<Key>;

    /// Position after the last row returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be expressed.
    fn cursor(&self) -> DsResult<Cursor>;

    /// Access to the concrete iterator.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Appends every remaining row of `iter` to `dst`.
///
/// # Errors
///
/// Returns the first iteration error other than [`DsError::Done`].
pub fn drain(ctx: &Context, iter: &mut dyn RawIterator, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
    let mut keys = Vec::new();
    loop {
        let mut row = PropertyList::new();
        match iter.next(ctx, &mut row) {
            Ok(key) => {
                keys.push(key);
                dst.push(row);
            }
            Err(DsError::Done) => return Ok(keys),
            Err(err) => return Err(err),
        }
    }
}

/// Counts the remaining rows of `iter`.
///
/// # Errors
///
/// Returns the first iteration error other than [`DsError::Done`].
pub fn count_rows(ctx: &Context, iter: &mut dyn RawIterator) -> DsResult<usize> {
    let mut count = 0;
    let mut row = PropertyList::new();
    loop {
        match iter.next(ctx, &mut row) {
            Ok(_) => count += 1,
            Err(DsError::Done) => return Ok(count),
            Err(err) => return Err(err),
        }
    }
}

/// Checks that keys and entities line up.
pub(crate) fn check_lengths(keys: usize, values: usize) -> DsResult<()> {
    if keys != values {
        return Err(DsError::invalid_argument(format!(
            "keys and values have different lengths: {keys} != {values}"
        )));
    }
    Ok(())
}

/// Flags invalid keys index-wise; `None` when every key is usable.
pub(crate) fn reject_invalid(keys: &[Key], allow_incomplete: bool) -> Option<DsError> {
    let mut errs = dsclient_codec::MultiError::new(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let usable = key.valid() && (allow_incomplete || !key.incomplete());
        if !usable {
            errs.set(i, DsError::InvalidKey);
        }
    }
    errs.has_errors().then(|| DsError::Multi(errs))
}
