//! Cloud adapter: the backend contract over a [`RemoteService`].

use super::service::{Call, RemoteService};
use super::wire::{
    AllocateIdsRequest, BeginTransactionRequest, CommitMode, CommitRequest, CommitResponse,
    LookupRequest, MoreResults, Mutation, PartitionId, ReadConsistency, ReadOptions,
    RollbackRequest, RunQueryRequest, WireEntity, WireKey, WireQuery,
};
use crate::backend::{check_lengths, reject_invalid, Backend, BackendTransaction, RawIterator};
use crate::config::{ClientOptions, TokenSource};
use bytes::Bytes;
use dsclient_codec::{
    Commit, Context, Cursor, DsError, DsResult, ErrorCode, Key, MultiError, PendingKey,
    PropertyList, Query, TransactionId,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct CloudInner {
    project_id: String,
    service: Arc<dyn RemoteService>,
    token_source: Option<Arc<dyn TokenSource>>,
    batch_size: usize,
    closed: AtomicBool,
}

impl CloudInner {
    fn call<'a>(&self, ctx: &'a Context) -> DsResult<Call<'a>> {
        ctx.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DsError::invalid_operation("backend is closed"));
        }
        let token = self.token_source.as_ref().map(|s| s.token()).transpose()?;
        Ok(Call { ctx, token })
    }

    fn wire_key(&self, key: &Key) -> WireKey {
        WireKey::from_key(key, &self.project_id)
    }

    fn upsert(&self, key: &Key, properties: &PropertyList) -> Mutation {
        Mutation::Upsert(WireEntity::from_properties(Some(key), properties, &self.project_id))
    }

    /// Looks keys up, retrying deferred keys until every key was answered.
    fn lookup(
        &self,
        ctx: &Context,
        keys: &[Key],
        dst: &mut [PropertyList],
        transaction: Option<&Bytes>,
    ) -> DsResult<()> {
        let mut positions: HashMap<&Key, Vec<usize>> = HashMap::new();
        let mut pending = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let slots = positions.entry(key).or_default();
            if slots.is_empty() {
                pending.push(self.wire_key(key));
            }
            slots.push(i);
        }

        let mut errs = MultiError::new(keys.len());
        let mut answered = vec![false; keys.len()];
        while !pending.is_empty() {
            let call = self.call(ctx)?;
            let asked = pending.len();
            let response = self.service.lookup(
                &call,
                LookupRequest {
                    project_id: self.project_id.clone(),
                    read_options: ReadOptions {
                        read_consistency: ReadConsistency::Strong,
                        transaction: transaction.cloned(),
                    },
                    keys: pending,
                },
            )?;
            if response.deferred.len() >= asked {
                return Err(DsError::backend(ErrorCode::Internal, "lookup made no progress"));
            }

            for found in response.found {
                let key = found.entity.key.as_ref().ok_or(DsError::InvalidKey)?.to_key()?;
                let properties = found.entity.to_properties()?;
                for &i in positions.get(&key).into_iter().flatten() {
                    dst[i] = properties.clone();
                    answered[i] = true;
                }
            }
            for missing in response.missing {
                let key = missing.entity.key.as_ref().ok_or(DsError::InvalidKey)?.to_key()?;
                for &i in positions.get(&key).into_iter().flatten() {
                    errs.set(i, DsError::NoSuchEntity);
                    answered[i] = true;
                }
            }
            if !response.deferred.is_empty() {
                trace!(deferred = response.deferred.len(), "retrying deferred lookup keys");
            }
            pending = response.deferred;
        }

        for (i, done) in answered.into_iter().enumerate() {
            if !done {
                errs.set(i, DsError::NoSuchEntity);
            }
        }
        errs.into_result()
    }

    fn commit(
        &self,
        ctx: &Context,
        mode: CommitMode,
        transaction: Option<Bytes>,
        mutations: Vec<Mutation>,
    ) -> DsResult<CommitResponse> {
        let call = self.call(ctx)?;
        let expected = mutations.len();
        let response = self.service.commit(
            &call,
            CommitRequest {
                project_id: self.project_id.clone(),
                mode,
                transaction,
                mutations,
            },
        )?;
        if response.mutation_results.len() != expected {
            return Err(DsError::backend(
                ErrorCode::Internal,
                format!(
                    "commit returned {} results for {expected} mutations",
                    response.mutation_results.len()
                ),
            ));
        }
        Ok(response)
    }

    fn resolved_key(response: &CommitResponse, index: usize, fallback: &Key) -> DsResult<Key> {
        match response.mutation_results.get(index).and_then(|r| r.key.as_ref()) {
            Some(key) => key.to_key(),
            None => Ok(fallback.clone()),
        }
    }
}

/// Backend speaking the cloud wire model.
#[derive(Debug, Clone)]
pub struct CloudBackend {
    inner: Arc<CloudInner>,
}

impl CloudBackend {
    /// Creates a backend for `project_id` over `service` with default options.
    pub fn new(project_id: impl Into<String>, service: Arc<dyn RemoteService>) -> Self {
        Self::with_options(project_id, service, &ClientOptions::default())
    }

    /// Creates a backend taking its token source and page size from `options`.
    pub fn with_options(
        project_id: impl Into<String>,
        service: Arc<dyn RemoteService>,
        options: &ClientOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CloudInner {
                project_id: project_id.into(),
                service,
                token_source: options.token_source.clone(),
                batch_size: options.query_batch_size.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The project the backend writes to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }
}

impl Backend for CloudBackend {
    fn name(&self) -> &'static str {
        super::NAME
    }

    fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> DsResult<Vec<Key>> {
        let mut errs = MultiError::new(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if !key.valid() || !key.incomplete() {
                errs.set(i, DsError::InvalidKey);
            }
        }
        errs.into_result()?;
        let call = self.inner.call(ctx)?;
        let response = self.inner.service.allocate_ids(
            &call,
            AllocateIdsRequest {
                project_id: self.inner.project_id.clone(),
                keys: keys.iter().map(|k| self.inner.wire_key(k)).collect(),
            },
        )?;
        response.keys.iter().map(WireKey::to_key).collect()
    }

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<Key>> {
        check_lengths(keys.len(), entities.len())?;
        if let Some(err) = reject_invalid(keys, true) {
            return Err(err);
        }
        let mutations = keys
            .iter()
            .zip(entities)
            .map(|(key, properties)| self.inner.upsert(key, properties))
            .collect();
        let response = self
            .inner
            .commit(ctx, CommitMode::NonTransactional, None, mutations)?;
        keys.iter()
            .enumerate()
            .map(|(i, key)| CloudInner::resolved_key(&response, i, key))
            .collect()
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        check_lengths(keys.len(), dst.len())?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        self.inner.lookup(ctx, keys, dst, None)
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        let mutations = keys
            .iter()
            .map(|key| Mutation::Delete(self.inner.wire_key(key)))
            .collect();
        self.inner
            .commit(ctx, CommitMode::NonTransactional, None, mutations)
            .map(|_| ())
    }

    fn new_transaction(&self, ctx: &Context) -> DsResult<Box<dyn BackendTransaction>> {
        let call = self.inner.call(ctx)?;
        let response = self.inner.service.begin_transaction(
            &call,
            BeginTransactionRequest {
                project_id: self.inner.project_id.clone(),
            },
        )?;
        let id = TransactionId::next();
        debug!(transaction = %id, "cloud transaction begun");
        Ok(Box::new(CloudTransaction {
            id,
            handle: response.transaction,
            inner: Arc::clone(&self.inner),
            state: Mutex::new(TransactionLog::default()),
        }))
    }

    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        ctx.check()?;
        Ok(Box::new(CloudIterator::new(Arc::clone(&self.inner), query, None)?))
    }

    fn close(&self) -> DsResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(DsError::invalid_operation("backend already closed"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TransactionLog {
    mutations: Vec<Mutation>,
    /// Mutation index and input key of each put, in slot order.
    puts: Vec<(usize, Key)>,
    finished: Option<&'static str>,
}

impl TransactionLog {
    fn ensure_active(&self) -> DsResult<()> {
        match self.finished {
            None => Ok(()),
            Some(state) => Err(DsError::invalid_operation(format!("transaction already {state}"))),
        }
    }
}

/// A transaction on a [`CloudBackend`].
///
/// Mutations are buffered locally and sent with the commit; reads go to the
/// service under the transaction handle.
#[derive(Debug)]
pub struct CloudTransaction {
    id: TransactionId,
    handle: Bytes,
    inner: Arc<CloudInner>,
    state: Mutex<TransactionLog>,
}

impl BackendTransaction for CloudTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn put_multi(&self, ctx: &Context, keys: &[Key], entities: &[PropertyList]) -> DsResult<Vec<PendingKey>> {
        ctx.check()?;
        check_lengths(keys.len(), entities.len())?;
        if let Some(err) = reject_invalid(keys, true) {
            return Err(err);
        }
        let mut log = self.state.lock();
        log.ensure_active()?;
        Ok(keys
            .iter()
            .zip(entities)
            .map(|(key, properties)| {
                let slot = log.puts.len();
                let index = log.mutations.len();
                log.mutations.push(self.inner.upsert(key, properties));
                log.puts.push((index, key.clone()));
                PendingKey::new(self.id, slot, key.clone())
            })
            .collect())
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        check_lengths(keys.len(), dst.len())?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        self.state.lock().ensure_active()?;
        self.inner.lookup(ctx, keys, dst, Some(&self.handle))
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> DsResult<()> {
        ctx.check()?;
        if let Some(err) = reject_invalid(keys, false) {
            return Err(err);
        }
        let mut log = self.state.lock();
        log.ensure_active()?;
        for key in keys {
            log.mutations.push(Mutation::Delete(self.inner.wire_key(key)));
        }
        Ok(())
    }

    fn run(&self, ctx: &Context, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        ctx.check()?;
        self.state.lock().ensure_active()?;
        Ok(Box::new(CloudIterator::new(
            Arc::clone(&self.inner),
            query,
            Some(self.handle.clone()),
        )?))
    }

    fn commit(&self, ctx: &Context) -> DsResult<Commit> {
        let (mutations, puts) = {
            let mut log = self.state.lock();
            log.ensure_active()?;
            log.finished = Some("committed");
            (std::mem::take(&mut log.mutations), std::mem::take(&mut log.puts))
        };
        let response = self.inner.commit(
            ctx,
            CommitMode::Transactional,
            Some(self.handle.clone()),
            mutations,
        )?;
        let keys = puts
            .iter()
            .map(|(index, key)| CloudInner::resolved_key(&response, *index, key))
            .collect::<DsResult<Vec<_>>>()?;
        debug!(transaction = %self.id, puts = keys.len(), "cloud transaction committed");
        Ok(Commit::new(self.id, keys))
    }

    fn rollback(&self, ctx: &Context) -> DsResult<()> {
        {
            let mut log = self.state.lock();
            log.ensure_active()?;
            log.finished = Some("rolled back");
            log.mutations.clear();
            log.puts.clear();
        }
        let detached = ctx.without_cancel();
        let call = self.inner.call(&detached)?;
        self.inner.service.rollback(
            &call,
            RollbackRequest {
                project_id: self.inner.project_id.clone(),
                transaction: self.handle.clone(),
            },
        )?;
        Ok(())
    }
}

/// Query iterator fetching result pages on demand.
#[derive(Debug)]
pub struct CloudIterator {
    inner: Arc<CloudInner>,
    base: WireQuery,
    namespace: String,
    read_options: ReadOptions,
    buffer: VecDeque<(Key, PropertyList, Option<Bytes>)>,
    next_start: Option<Bytes>,
    offset: i32,
    remaining: Option<i32>,
    cursor: Cursor,
    exhausted: bool,
    pages: usize,
}

impl CloudIterator {
    fn new(inner: Arc<CloudInner>, query: &Query, transaction: Option<Bytes>) -> DsResult<Self> {
        let mut base = WireQuery::from_query(query, &inner.project_id)?;
        base.end_cursor = query
            .end_cursor()
            .map(|c| Bytes::copy_from_slice(c.as_bytes()));
        let read_options = ReadOptions {
            read_consistency: if query.is_eventual() {
                ReadConsistency::Eventual
            } else {
                ReadConsistency::Strong
            },
            transaction,
        };
        let remaining = query.limit_value();
        Ok(Self {
            inner,
            base,
            namespace: query.namespace_name().to_string(),
            read_options,
            buffer: VecDeque::new(),
            next_start: query
                .start_cursor()
                .map(|c| Bytes::copy_from_slice(c.as_bytes())),
            offset: query.offset_value(),
            remaining,
            cursor: query.start_cursor().cloned().unwrap_or_default(),
            exhausted: remaining == Some(0),
            pages: 0,
        })
    }

    /// Result pages fetched so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    fn fetch(&mut self, ctx: &Context) -> DsResult<()> {
        let page = i32::try_from(self.inner.batch_size).unwrap_or(i32::MAX);
        let mut query = self.base.clone();
        query.start_cursor = self.next_start.clone();
        query.offset = self.offset;
        query.limit = Some(self.remaining.map_or(page, |r| r.min(page)));

        let call = self.inner.call(ctx)?;
        let response = self.inner.service.run_query(
            &call,
            RunQueryRequest {
                project_id: self.inner.project_id.clone(),
                partition_id: PartitionId {
                    project_id: self.inner.project_id.clone(),
                    namespace_id: self.namespace.clone(),
                },
                read_options: self.read_options.clone(),
                query,
            },
        )?;
        let batch = response.batch;
        self.pages += 1;

        if let Some(skipped) = batch.skipped_cursor {
            self.cursor = Cursor::from_bytes(skipped.to_vec());
        }
        self.offset = (self.offset - batch.skipped_results).max(0);
        let returned = i32::try_from(batch.entity_results.len()).unwrap_or(i32::MAX);
        if let Some(remaining) = &mut self.remaining {
            *remaining = (*remaining - returned).max(0);
        }
        for result in batch.entity_results {
            let key = result.entity.key.as_ref().ok_or(DsError::InvalidKey)?.to_key()?;
            let properties = result.entity.to_properties()?;
            self.buffer.push_back((key, properties, result.cursor));
        }
        self.next_start = Some(batch.end_cursor);

        let stalled = returned == 0 && batch.skipped_results == 0;
        self.exhausted = self.remaining == Some(0)
            || match batch.more_results {
                MoreResults::NotFinished | MoreResults::MoreResultsAfterLimit => stalled,
                MoreResults::MoreResultsAfterCursor | MoreResults::NoMoreResults => true,
            };
        trace!(page = self.pages, returned, exhausted = self.exhausted, "fetched query page");
        Ok(())
    }
}

impl RawIterator for CloudIterator {
    fn next(&mut self, ctx: &Context, dst: &mut PropertyList) -> DsResult<Key> {
        loop {
            if let Some((key, properties, cursor)) = self.buffer.pop_front() {
                if let Some(cursor) = cursor {
                    self.cursor = Cursor::from_bytes(cursor.to_vec());
                }
                *dst = properties;
                return Ok(key);
            }
            if self.exhausted {
                return Err(DsError::Done);
            }
            self.fetch(ctx)?;
        }
    }

    fn cursor(&self) -> DsResult<Cursor> {
        Ok(self.cursor.clone())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
