//! Client facade.

use crate::batch::Batch;
use crate::iterator::QueryIterator;
use crate::middleware::{Middleware, MiddlewareInfo};
use crate::transaction::Transaction;
use dsclient_codec::{
    load_entity, Commit, Context, Cursor, DsError, DsResult, Entity, Key, MultiError,
    PropertyList, PropertyLoadSaver, Query,
};
use dsclient_storage::{open_backend, Backend, ClientOptions};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Handle to a datastore through the middleware chain.
///
/// Cloning a client is cheap; clones share the backend, the middleware list
/// and the base context.
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::from_context(&ctx, ClientOptions::new().project_id("demo"))?;
/// let key = client.id_key("Data", 111, None);
/// client.put(&ctx, &key, &Data { name: "Data".into() })?;
///
/// let mut loaded = Data::default();
/// client.get(&ctx, &key, &mut loaded)?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    backend: Arc<dyn Backend>,
    options: ClientOptions,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    context: RwLock<Context>,
}

impl Client {
    /// Opens a client on the registered backend.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no backend is registered or the
    /// backend rejects the options.
    pub fn from_context(ctx: &Context, options: ClientOptions) -> DsResult<Self> {
        let backend = open_backend(ctx, &options)?;
        debug!(backend = backend.name(), "client opened");
        Ok(Self::with_context(backend, options, ctx.clone()))
    }

    /// Creates a client over an already opened backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, options: ClientOptions) -> Self {
        Self::with_context(backend, options, Context::background())
    }

    fn with_context(backend: Arc<dyn Backend>, options: ClientOptions, context: Context) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                backend,
                options,
                middlewares: RwLock::new(Vec::new()),
                context: RwLock::new(context),
            }),
        }
    }

    /// The backend at the bottom of the chain.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// The options the client was created with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The client's base context.
    #[must_use]
    pub fn context(&self) -> Context {
        self.inner.context.read().clone()
    }

    /// Replaces the client's base context.
    pub fn set_context(&self, ctx: Context) {
        *self.inner.context.write() = ctx;
    }

    /// Appends a middleware. It becomes the innermost one.
    ///
    /// Must not be called while operations are in flight.
    pub fn append_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middlewares.write().push(middleware);
    }

    /// Removes a middleware by identity. Returns false if it was not appended.
    ///
    /// Must not be called while operations are in flight.
    pub fn remove_middleware(&self, middleware: &Arc<dyn Middleware>) -> bool {
        let mut middlewares = self.inner.middlewares.write();
        let before = middlewares.len();
        middlewares.retain(|m| !Arc::ptr_eq(m, middleware));
        middlewares.len() != before
    }

    /// The appended middlewares, outermost first.
    #[must_use]
    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner.middlewares.read().clone()
    }

    /// Builds the head of the chain for one operation.
    pub(crate) fn info(&self, ctx: &Context, transaction: Option<&Transaction>) -> MiddlewareInfo {
        let snapshot: Arc<[Arc<dyn Middleware>]> = self.inner.middlewares.read().as_slice().into();
        MiddlewareInfo::new(
            ctx.clone(),
            self.clone(),
            transaction.cloned(),
            snapshot,
            Arc::clone(&self.inner.backend),
        )
    }

    /// Completes incomplete keys without storing anything.
    ///
    /// # Errors
    ///
    /// Returns a multi-error for complete or malformed keys.
    pub fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> DsResult<Vec<Key>> {
        let info = self.info(ctx, None);
        info.next.allocate_ids(&info, keys)
    }

    /// Stores one value.
    ///
    /// # Errors
    ///
    /// Returns the save or backend error for the value.
    pub fn put<T: PropertyLoadSaver + ?Sized>(&self, ctx: &Context, key: &Key, src: &T) -> DsResult<Key> {
        let properties = src.save(ctx)?;
        self.put_properties(ctx, std::slice::from_ref(key), &[properties])
            .map_err(DsError::unwrap_single)
            .and_then(single)
    }

    /// Stores values; keys and values are index-aligned.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error when any value fails to save or
    /// store.
    pub fn put_multi<T: PropertyLoadSaver>(&self, ctx: &Context, keys: &[Key], src: &[T]) -> DsResult<Vec<Key>> {
        check_lengths(keys.len(), src.len())?;
        let entities = save_all(ctx, src)?;
        self.put_properties(ctx, keys, &entities)
    }

    /// Stores property lists through the chain without the codec.
    ///
    /// # Errors
    ///
    /// Errors of the chain.
    pub fn put_properties(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Key>> {
        check_lengths(keys.len(), entities.len())?;
        let info = self.info(ctx, None);
        info.next.put_multi_without_tx(&info, keys, entities)
    }

    /// Loads one entity into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::NoSuchEntity`] when the entity is missing, or the
    /// load error.
    pub fn get<T: PropertyLoadSaver + ?Sized>(&self, ctx: &Context, key: &Key, dst: &mut T) -> DsResult<()> {
        let mut props = vec![PropertyList::new()];
        self.get_properties(ctx, std::slice::from_ref(key), &mut props)
            .map_err(DsError::unwrap_single)?;
        let properties = props.pop().unwrap_or_default();
        load_entity(ctx, dst, Entity::new(Some(key.clone()), properties))
    }

    /// Loads entities into `dst`; keys and destinations are index-aligned.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error. Positions without an error are
    /// loaded even when others failed.
    pub fn get_multi<T: PropertyLoadSaver>(&self, ctx: &Context, keys: &[Key], dst: &mut [T]) -> DsResult<()> {
        check_lengths(keys.len(), dst.len())?;
        let mut props = vec![PropertyList::new(); keys.len()];
        let fetched = self.get_properties(ctx, keys, &mut props);
        load_all(ctx, keys, props, dst, fetched)
    }

    /// Reads property lists through the chain without the codec.
    ///
    /// # Errors
    ///
    /// Errors of the chain.
    pub fn get_properties(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        check_lengths(keys.len(), dst.len())?;
        let info = self.info(ctx, None);
        info.next.get_multi_without_tx(&info, keys, dst)
    }

    /// Deletes one entity. Deleting a missing entity succeeds.
    ///
    /// # Errors
    ///
    /// Returns the backend error for the key.
    pub fn delete(&self, ctx: &Context, key: &Key) -> DsResult<()> {
        self.delete_multi(ctx, std::slice::from_ref(key))
            .map_err(DsError::unwrap_single)
    }

    /// Deletes entities.
    ///
    /// # Errors
    ///
    /// Returns an index-aligned multi-error for rejected keys.
    pub fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        let info = self.info(ctx, None);
        info.next.delete_multi_without_tx(&info, keys)
    }

    /// Begins a transaction bound to `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn new_transaction(&self, ctx: &Context) -> DsResult<Transaction> {
        let raw = self.inner.backend.new_transaction(ctx)?;
        Ok(Transaction::new(self.clone(), ctx.clone(), raw))
    }

    /// Runs `f` in a transaction and commits it, retrying on contention.
    ///
    /// The transaction is rolled back when `f` fails. A commit that loses to a
    /// concurrent writer is retried with a fresh transaction up to the
    /// configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, the commit error, or
    /// [`DsError::ConcurrentTransaction`] once the attempts are spent.
    pub fn run_in_transaction<F>(&self, ctx: &Context, mut f: F) -> DsResult<Commit>
    where
        F: FnMut(&Transaction) -> DsResult<()>,
    {
        let attempts = self.inner.options.transaction_attempts.max(1);
        for attempt in 1..=attempts {
            let tx = self.new_transaction(ctx)?;
            if let Err(err) = f(&tx) {
                if tx.is_active() {
                    if let Err(rollback) = tx.rollback() {
                        debug!(transaction = %tx.id(), error = %rollback, "rollback after failure failed");
                    }
                }
                return Err(err);
            }
            match tx.commit() {
                Ok(commit) => return Ok(commit),
                Err(DsError::ConcurrentTransaction) => {
                    debug!(transaction = %tx.id(), attempt, "transaction contended, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(DsError::ConcurrentTransaction)
    }

    /// Starts a query.
    ///
    /// # Errors
    ///
    /// Returns the query's builder error or the chain's error.
    pub fn run(&self, ctx: &Context, query: &Query) -> DsResult<QueryIterator> {
        QueryIterator::start(self.clone(), ctx.clone(), None, query.clone())
    }

    /// Counts the rows of a query.
    ///
    /// # Errors
    ///
    /// Returns the query's builder error or the chain's error.
    pub fn count(&self, ctx: &Context, query: &Query) -> DsResult<usize> {
        query.validate()?;
        let info = self.info(ctx, None);
        info.next.count(&info, query)
    }

    /// Loads every row of a query into `dst` and returns the row keys.
    ///
    /// Keys-only queries leave `dst` untouched.
    ///
    /// # Errors
    ///
    /// Returns the chain's error, or the first load error after every row was
    /// loaded.
    pub fn get_all<T: PropertyLoadSaver + Default>(
        &self,
        ctx: &Context,
        query: &Query,
        dst: &mut Vec<T>,
    ) -> DsResult<Vec<Key>> {
        query.validate()?;
        let info = self.info(ctx, None);
        collect_all(&info, query, dst)
    }

    /// Creates an incomplete key.
    #[must_use]
    pub fn incomplete_key(&self, kind: &str, parent: Option<&Key>) -> Key {
        Key::incomplete_key(kind, parent)
    }

    /// Creates a key with a string id.
    #[must_use]
    pub fn name_key(&self, kind: &str, name: &str, parent: Option<&Key>) -> Key {
        Key::name_key(kind, name, parent)
    }

    /// Creates a key with a numeric id.
    #[must_use]
    pub fn id_key(&self, kind: &str, id: i64, parent: Option<&Key>) -> Key {
        Key::id_key(kind, id, parent)
    }

    /// Creates a query over `kind`.
    #[must_use]
    pub fn new_query(&self, kind: &str) -> Query {
        Query::new(kind)
    }

    /// Decodes an opaque key string produced by any backend.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed input.
    pub fn decode_key(&self, encoded: &str) -> DsResult<Key> {
        self.inner.backend.decode_key(encoded)
    }

    /// Decodes a cursor from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidArgument`] for malformed input.
    pub fn decode_cursor(&self, encoded: &str) -> DsResult<Cursor> {
        Cursor::decode(encoded)
    }

    /// Creates an empty batch dispatching through this client.
    #[must_use]
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    /// Releases the backend. Later operations fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the client was already closed.
    pub fn close(&self) -> DsResult<()> {
        debug!(backend = self.inner.backend.name(), "client closed");
        self.inner.backend.close()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("backend", &self.inner.backend.name())
            .field("middlewares", &self.inner.middlewares.read().len())
            .finish_non_exhaustive()
    }
}

fn single<T>(mut values: Vec<T>) -> DsResult<T> {
    values
        .pop()
        .ok_or_else(|| DsError::invalid_operation("backend returned no result"))
}

pub(crate) fn check_lengths(keys: usize, values: usize) -> DsResult<()> {
    if keys != values {
        return Err(DsError::invalid_argument(format!(
            "keys and values have different lengths: {keys} != {values}"
        )));
    }
    Ok(())
}

/// Saves every value, reporting failures index-aligned.
pub(crate) fn save_all<T: PropertyLoadSaver>(ctx: &Context, src: &[T]) -> DsResult<Vec<PropertyList>> {
    let mut errs = MultiError::new(src.len());
    let mut entities = Vec::with_capacity(src.len());
    for (i, value) in src.iter().enumerate() {
        match value.save(ctx) {
            Ok(properties) => entities.push(properties),
            Err(err) => {
                errs.set(i, err);
                entities.push(PropertyList::new());
            }
        }
    }
    errs.into_result()?;
    Ok(entities)
}

/// Loads fetched property lists into `dst`, merging load errors into the
/// fetch outcome index by index.
pub(crate) fn load_all<T: PropertyLoadSaver>(
    ctx: &Context,
    keys: &[Key],
    props: Vec<PropertyList>,
    dst: &mut [T],
    fetched: DsResult<()>,
) -> DsResult<()> {
    let mut errs = match fetched {
        Ok(()) => MultiError::new(keys.len()),
        Err(DsError::Multi(errs)) if errs.len() == keys.len() => errs,
        Err(err) => return Err(err),
    };
    for (i, properties) in props.into_iter().enumerate() {
        if errs.get(i).is_some() {
            continue;
        }
        if let Err(err) = load_entity(ctx, &mut dst[i], Entity::new(Some(keys[i].clone()), properties)) {
            errs.set(i, err);
        }
    }
    errs.into_result()
}

/// Runs `get_all` through the chain and loads the rows.
pub(crate) fn collect_all<T: PropertyLoadSaver + Default>(
    info: &MiddlewareInfo,
    query: &Query,
    dst: &mut Vec<T>,
) -> DsResult<Vec<Key>> {
    let mut rows = Vec::new();
    let keys = info.next.get_all(info, query, &mut rows)?;
    if query.is_keys_only() {
        return Ok(keys);
    }
    let mut first = None;
    for (key, properties) in keys.iter().zip(rows) {
        let mut value = T::default();
        if let Err(err) = load_entity(&info.context, &mut value, Entity::new(Some(key.clone()), properties)) {
            first.get_or_insert(err);
        }
        dst.push(value);
    }
    match first {
        Some(err) => Err(err),
        None => Ok(keys),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::{Record, Schema};
    use dsclient_storage::embedded::EmbeddedBackend;
    use dsclient_storage::Engine;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Data {
        name: String,
    }

    impl Record for Data {
        fn describe(schema: &mut Schema<Self>) {
            schema.field("Name", "", |r| &r.name, |r| &mut r.name);
        }
    }

    fn client() -> Client {
        Client::new(
            Arc::new(EmbeddedBackend::new(Arc::new(Engine::new()))),
            ClientOptions::default(),
        )
    }

    #[test]
    fn single_item_round_trip() {
        let ctx = Context::background();
        let client = client();
        let key = client.id_key("Data", 111, None);

        client
            .put(&ctx, &key, &Data { name: "Data".into() })
            .unwrap();
        let mut loaded = Data::default();
        client.get(&ctx, &key, &mut loaded).unwrap();
        assert_eq!(loaded.name, "Data");

        client.delete(&ctx, &key).unwrap();
        let err = client.get(&ctx, &key, &mut Data::default()).unwrap_err();
        assert_eq!(err, DsError::NoSuchEntity);
    }

    #[test]
    fn put_completes_incomplete_keys() {
        let ctx = Context::background();
        let client = client();
        let key = client
            .put(&ctx, &client.incomplete_key("Data", None), &Data::default())
            .unwrap();
        assert!(!key.incomplete());
    }

    #[test]
    fn get_multi_loads_found_positions() {
        let ctx = Context::background();
        let client = client();
        let keys: Vec<Key> = (1..=3).map(|id| client.id_key("Data", id, None)).collect();
        let values: Vec<Data> = (1..=3).map(|id| Data { name: format!("#{id}") }).collect();
        client.put_multi(&ctx, &keys, &values).unwrap();
        client.delete(&ctx, &keys[1]).unwrap();

        let mut dst = vec![Data::default(); 3];
        let err = client.get_multi(&ctx, &keys, &mut dst).unwrap_err();
        let DsError::Multi(errs) = err else {
            panic!("expected multi error");
        };
        assert_eq!(errs.len(), 3);
        assert!(errs.get(0).is_none());
        assert_eq!(errs.get(1), Some(&DsError::NoSuchEntity));
        assert_eq!(dst[0].name, "#1");
        assert_eq!(dst[2].name, "#3");
    }

    #[test]
    fn mismatched_lengths_fail_before_dispatch() {
        let ctx = Context::background();
        let client = client();
        let keys = vec![client.id_key("Data", 1, None)];
        let err = client.put_multi::<Data>(&ctx, &keys, &[]).unwrap_err();
        assert!(matches!(err, DsError::InvalidArgument { .. }));
    }

    #[test]
    fn middlewares_are_removed_by_identity() {
        struct Passthrough;
        impl Middleware for Passthrough {}

        let client = client();
        let first: Arc<dyn Middleware> = Arc::new(Passthrough);
        let second: Arc<dyn Middleware> = Arc::new(Passthrough);
        client.append_middleware(Arc::clone(&first));
        client.append_middleware(Arc::clone(&second));

        assert!(client.remove_middleware(&first));
        assert!(!client.remove_middleware(&first));
        assert_eq!(client.middlewares().len(), 1);
        assert!(Arc::ptr_eq(&client.middlewares()[0], &second));
    }

    #[test]
    fn get_all_loads_rows_in_order() {
        let ctx = Context::background();
        let client = client();
        let keys: Vec<Key> = (1..=3).map(|id| client.id_key("Data", id, None)).collect();
        let values: Vec<Data> = (1..=3).map(|id| Data { name: format!("#{id}") }).collect();
        client.put_multi(&ctx, &keys, &values).unwrap();

        let mut rows: Vec<Data> = Vec::new();
        let found = client
            .get_all(&ctx, &client.new_query("Data").order("-Name"), &mut rows)
            .unwrap();
        assert_eq!(found, keys.iter().rev().cloned().collect::<Vec<_>>());
        assert_eq!(rows[0].name, "#3");
        assert_eq!(client.count(&ctx, &client.new_query("Data")).unwrap(), 3);
    }

    #[test]
    fn context_is_replaceable() {
        let client = client();
        let (ctx, cancel) = Context::background().with_cancel();
        client.set_context(ctx);
        cancel.cancel();
        assert_eq!(client.context().err(), Some(DsError::Canceled));
    }

    proptest::proptest! {
        #[test]
        fn get_errors_line_up_with_their_keys(present in proptest::collection::vec(proptest::bool::ANY, 1..12)) {
            let ctx = Context::background();
            let client = client();
            let keys: Vec<Key> = (1..=present.len() as i64).map(|id| client.id_key("Data", id, None)).collect();
            for (key, _) in keys.iter().zip(&present).filter(|(_, here)| **here) {
                client.put(&ctx, key, &Data { name: key.to_string() }).unwrap();
            }

            let mut dst = vec![Data::default(); keys.len()];
            match client.get_multi(&ctx, &keys, &mut dst) {
                Ok(()) => proptest::prop_assert!(present.iter().all(|here| *here)),
                Err(DsError::Multi(errs)) => {
                    proptest::prop_assert_eq!(errs.len(), keys.len());
                    for (i, here) in present.iter().enumerate() {
                        if *here {
                            proptest::prop_assert!(errs.get(i).is_none());
                            proptest::prop_assert_eq!(&dst[i].name, &keys[i].to_string());
                        } else {
                            proptest::prop_assert_eq!(errs.get(i), Some(&DsError::NoSuchEntity));
                        }
                    }
                }
                Err(other) => proptest::prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
