//! Batch coordinator.
//!
//! A batch collects single-item puts, gets and deletes and dispatches each
//! kind as one multi-key call when [`Batch::exec`] runs. Results are delivered
//! per item on the channel returned when the item was queued.
//!
//! Values are saved and loaded during `exec`, with the running batch placed
//! in the context handed to record hooks. A hook may queue more work on the
//! same batch (`ctx.value::<Batch>()`); `exec` keeps dispatching waves until
//! every queue is empty.
//!
//! ```rust,ignore
//! let batch = client.batch();
//! let stored = batch.put(key.clone(), Data { name: "a".into() });
//! let loaded = batch.get::<Data>(other);
//! batch.exec(&ctx)?;
//! let key = stored.recv()??;
//! ```

use crate::client::Client;
use crate::transaction::Transaction;
use dsclient_codec::{
    load_entity, Context, DsError, DsResult, Entity, ErrorCode, Key, MultiError, PendingKey,
    PropertyList, PropertyLoadSaver,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::debug;

type Deliver = Box<dyn FnOnce(&Context, DsResult<PropertyList>) + Send>;

struct PutItem<R> {
    key: Key,
    src: Box<dyn PropertyLoadSaver + Send>,
    reply: Sender<DsResult<R>>,
}

struct GetItem {
    key: Key,
    deliver: Deliver,
}

struct DeleteItem {
    key: Key,
    reply: Sender<DsResult<()>>,
}

/// Per-kind queues of a batch. Each kind has its own lock.
pub(crate) struct BatchQueues<R> {
    puts: Mutex<Vec<PutItem<R>>>,
    gets: Mutex<Vec<GetItem>>,
    deletes: Mutex<Vec<DeleteItem>>,
}

impl<R: Send + 'static> BatchQueues<R> {
    pub(crate) fn new() -> Self {
        Self {
            puts: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    fn put<T: PropertyLoadSaver + Send + 'static>(&self, key: Key, src: T) -> Receiver<DsResult<R>> {
        let (reply, rx) = channel();
        self.puts.lock().push(PutItem {
            key,
            src: Box::new(src),
            reply,
        });
        rx
    }

    fn get<T: PropertyLoadSaver + Default + Send + 'static>(&self, key: Key) -> Receiver<DsResult<T>> {
        let (reply, rx) = channel();
        let loaded_key = key.clone();
        let deliver: Deliver = Box::new(move |ctx: &Context, fetched: DsResult<PropertyList>| {
            let result = fetched.and_then(|properties| {
                let mut value = T::default();
                load_entity(ctx, &mut value, Entity::new(Some(loaded_key), properties))?;
                Ok(value)
            });
            let _ = reply.send(result);
        });
        self.gets.lock().push(GetItem { key, deliver });
        rx
    }

    fn delete(&self, key: Key) -> Receiver<DsResult<()>> {
        let (reply, rx) = channel();
        self.deletes.lock().push(DeleteItem { key, reply });
        rx
    }

    fn pending(&self) -> usize {
        self.puts.lock().len() + self.gets.lock().len() + self.deletes.lock().len()
    }
}

/// The multi-key calls a batch dispatches to.
trait Target: Sync {
    type Put: Send + 'static;

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Self::Put>>;
    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()>;
    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()>;
}

impl Target for Client {
    type Put = Key;

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Key>> {
        self.put_properties(ctx, keys, entities)
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.get_properties(ctx, keys, dst)
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        Client::delete_multi(self, ctx, keys)
    }
}

impl Target for Transaction {
    type Put = PendingKey;

    fn put_multi(&self, _ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<PendingKey>> {
        self.put_properties(keys, entities)
    }

    fn get_multi(&self, _ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.get_properties(keys, dst)
    }

    fn delete_multi(&self, _ctx: &Context, keys: &[Key]) -> DsResult<()> {
        Transaction::delete_multi(self, keys)
    }
}

/// The error reported to item `index` of a failed multi-key call.
fn item_error(err: &DsError, index: usize, len: usize) -> Option<DsError> {
    match err {
        DsError::Multi(errs) if errs.len() == len => errs.get(index).cloned(),
        // Positions without their own error were not applied either.
        other => Some(other.clone()),
    }
}

fn dispatch_puts<T: Target>(target: &T, ctx: &Context, items: Vec<PutItem<T::Put>>) -> DsResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut keys = Vec::with_capacity(items.len());
    let mut entities = Vec::with_capacity(items.len());
    let mut replies = Vec::with_capacity(items.len());
    let mut save_failed = false;
    for item in items {
        match item.src.save(ctx) {
            Ok(properties) => {
                keys.push(item.key);
                entities.push(properties);
                replies.push(item.reply);
            }
            Err(err) => {
                save_failed = true;
                let _ = item.reply.send(Err(err));
            }
        }
    }
    if keys.is_empty() {
        return Err(DsError::invalid_argument("every batched value failed to save"));
    }

    match target.put_multi(ctx, &keys, &entities) {
        Ok(stored) if stored.len() == replies.len() => {
            for (reply, key) in replies.into_iter().zip(stored) {
                let _ = reply.send(Ok(key));
            }
            if save_failed {
                return Err(DsError::invalid_argument("some batched values failed to save"));
            }
            Ok(())
        }
        Ok(stored) => {
            let err = DsError::backend(
                ErrorCode::Internal,
                format!("put returned {} keys for {} entities", stored.len(), replies.len()),
            );
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
            Err(err)
        }
        Err(err) => {
            let len = replies.len();
            for (i, reply) in replies.into_iter().enumerate() {
                let item = item_error(&err, i, len).unwrap_or_else(|| err.clone());
                let _ = reply.send(Err(item));
            }
            Err(err)
        }
    }
}

fn dispatch_gets<T: Target>(target: &T, ctx: &Context, items: Vec<GetItem>) -> DsResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let keys: Vec<Key> = items.iter().map(|item| item.key.clone()).collect();
    let mut props = vec![PropertyList::new(); keys.len()];
    let fetched = target.get_multi(ctx, &keys, &mut props);
    for (i, (item, properties)) in items.into_iter().zip(props).enumerate() {
        let outcome = match &fetched {
            Ok(()) => Ok(properties),
            Err(err) => match item_error(err, i, keys.len()) {
                Some(item_err) => Err(item_err),
                None => Ok(properties),
            },
        };
        (item.deliver)(ctx, outcome);
    }
    fetched
}

fn dispatch_deletes<T: Target>(target: &T, ctx: &Context, items: Vec<DeleteItem>) -> DsResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let keys: Vec<Key> = items.iter().map(|item| item.key.clone()).collect();
    let deleted = target.delete_multi(ctx, &keys);
    for (i, item) in items.into_iter().enumerate() {
        let outcome = match &deleted {
            Ok(()) => Ok(()),
            Err(err) => item_error(err, i, keys.len()).map_or(Ok(()), Err),
        };
        let _ = item.reply.send(outcome);
    }
    deleted
}

fn joined(handle: thread::ScopedJoinHandle<'_, DsResult<()>>) -> DsResult<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(DsError::backend(ErrorCode::Internal, "batch dispatch panicked")))
}

/// Dispatches waves until every queue is empty.
fn exec<T: Target>(target: &T, queues: &BatchQueues<T::Put>, ctx: &Context) -> DsResult<()> {
    let mut failures = Vec::new();
    let mut wave = 0usize;
    loop {
        let puts = std::mem::take(&mut *queues.puts.lock());
        let gets = std::mem::take(&mut *queues.gets.lock());
        let deletes = std::mem::take(&mut *queues.deletes.lock());
        if puts.is_empty() && gets.is_empty() && deletes.is_empty() {
            break;
        }
        wave += 1;
        debug!(
            wave,
            puts = puts.len(),
            gets = gets.len(),
            deletes = deletes.len(),
            "batch wave"
        );

        let outcomes = thread::scope(|scope| {
            let put = scope.spawn(|| dispatch_puts(target, ctx, puts));
            let get = scope.spawn(|| dispatch_gets(target, ctx, gets));
            let delete = dispatch_deletes(target, ctx, deletes);
            [joined(put), joined(get), delete]
        });
        failures.extend(outcomes.into_iter().filter_map(Result::err));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(DsError::Multi(MultiError::from_vec(
            failures.into_iter().map(Some).collect(),
        )))
    }
}

/// Aggregates single-item operations into multi-key calls outside a
/// transaction.
///
/// Appends are safe from several threads. `exec` is meant to be driven by one
/// thread at a time.
#[derive(Clone)]
pub struct Batch {
    client: Client,
    queues: Arc<BatchQueues<Key>>,
}

impl Batch {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            queues: Arc::new(BatchQueues::new()),
        }
    }

    /// Queues a put. The value is saved during [`exec`](Self::exec).
    pub fn put<T: PropertyLoadSaver + Send + 'static>(&self, key: Key, src: T) -> Receiver<DsResult<Key>> {
        self.queues.put(key, src)
    }

    /// Queues a get. The loaded value is delivered on the returned channel.
    pub fn get<T: PropertyLoadSaver + Default + Send + 'static>(&self, key: Key) -> Receiver<DsResult<T>> {
        self.queues.get(key)
    }

    /// Queues a delete.
    pub fn delete(&self, key: Key) -> Receiver<DsResult<()>> {
        self.queues.delete(key)
    }

    /// Number of queued operations not yet dispatched.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.pending()
    }

    /// Dispatches every queued operation, including work queued by hooks
    /// while dispatching.
    ///
    /// Every channel handed out before `exec` returns has received exactly one
    /// value when it returns.
    ///
    /// # Errors
    ///
    /// Returns a multi-error holding each failed multi-key call. Per-item
    /// errors are delivered on the item channels regardless.
    pub fn exec(&self, ctx: &Context) -> DsResult<()> {
        let ctx = ctx.with_value(self.clone());
        exec(&self.client, &self.queues, &ctx)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// The batch of a [`Transaction`]. Puts yield pending keys resolved by the
/// transaction's commit.
#[derive(Clone)]
pub struct TransactionBatch {
    transaction: Transaction,
    queues: Arc<BatchQueues<PendingKey>>,
}

impl TransactionBatch {
    pub(crate) fn new(transaction: Transaction, queues: Arc<BatchQueues<PendingKey>>) -> Self {
        Self {
            transaction,
            queues,
        }
    }

    /// The transaction the batch dispatches to.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Queues a put. The value is saved during [`exec`](Self::exec).
    pub fn put<T: PropertyLoadSaver + Send + 'static>(&self, key: Key, src: T) -> Receiver<DsResult<PendingKey>> {
        self.queues.put(key, src)
    }

    /// Queues a get. The loaded value is delivered on the returned channel.
    pub fn get<T: PropertyLoadSaver + Default + Send + 'static>(&self, key: Key) -> Receiver<DsResult<T>> {
        self.queues.get(key)
    }

    /// Queues a delete.
    pub fn delete(&self, key: Key) -> Receiver<DsResult<()>> {
        self.queues.delete(key)
    }

    /// Number of queued operations not yet dispatched.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.pending()
    }

    /// Dispatches every queued operation against the transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Batch::exec`].
    pub fn exec(&self, ctx: &Context) -> DsResult<()> {
        let ctx = ctx.with_value(self.clone());
        exec(&self.transaction, &self.queues, &ctx)
    }
}

impl fmt::Debug for TransactionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBatch")
            .field("transaction", &self.transaction.id())
            .field("pending", &self.pending())
            .finish()
    }
}
