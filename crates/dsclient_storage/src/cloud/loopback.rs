//! A [`RemoteService`] answering from an in-process [`Engine`].

use super::service::{Call, RemoteService, Status, INVALID_KEY_PREFIX};
use super::wire::{
    AllocateIdsRequest, AllocateIdsResponse, BeginTransactionRequest, BeginTransactionResponse,
    CommitMode, CommitRequest, CommitResponse, EntityResult, LookupRequest, LookupResponse,
    MoreResults, Mutation, MutationResult, QueryResultBatch, ResultType, RollbackRequest,
    RunQueryRequest, RunQueryResponse, WireEntity, WireKey,
};
use crate::engine::{cursor_position, position_cursor, Engine, EngineTransaction};
use crate::error::EngineError;
use bytes::Bytes;
use dsclient_codec::{Cursor, ErrorCode, Key, PropertyList};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

fn status(err: EngineError) -> Status {
    match err {
        EngineError::InvalidKey { .. } | EngineError::InvalidQuery(_) | EngineError::InvalidCursor => {
            Status::invalid_argument(err.to_string())
        }
        EngineError::Conflict { .. } => Status::aborted(err.to_string()),
        EngineError::TransactionNotActive { .. } => {
            Status::new(ErrorCode::FailedPrecondition, err.to_string())
        }
        EngineError::Closed => Status::new(ErrorCode::Unavailable, err.to_string()),
    }
}

fn client_key(key: &WireKey) -> Result<Key, Status> {
    key.to_key()
        .map_err(|_| Status::invalid_argument(format!("{INVALID_KEY_PREFIX}: malformed path")))
}

fn bytes_of(cursor: &Cursor) -> Bytes {
    Bytes::copy_from_slice(cursor.as_bytes())
}

/// Serves the wire protocol from an [`Engine`].
///
/// Used by tests and for local development in place of a remote service.
/// Lookups larger than the lookup limit defer the excess keys; query pages
/// are capped at the page limit.
#[derive(Debug)]
pub struct LoopbackService {
    engine: Arc<Engine>,
    transactions: Mutex<HashMap<Bytes, EngineTransaction>>,
    lookup_limit: usize,
    page_limit: usize,
    token: Option<String>,
    requests: AtomicUsize,
}

impl LoopbackService {
    /// Creates a service over `engine`.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            transactions: Mutex::new(HashMap::new()),
            lookup_limit: 1000,
            page_limit: 1000,
            token: None,
            requests: AtomicUsize::new(0),
        }
    }

    /// Caps the keys processed per lookup.
    #[must_use]
    pub fn with_lookup_limit(mut self, limit: usize) -> Self {
        self.lookup_limit = limit.max(1);
        self
    }

    /// Caps the results returned per query page.
    #[must_use]
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Rejects calls not carrying `token`.
    #[must_use]
    pub fn require_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The engine answering the calls.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Number of requests served so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of transactions begun and not yet finished.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    fn accept(&self, call: &Call<'_>) -> Result<(), Status> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = call.ctx.err() {
            return Err(Status::new(ErrorCode::DeadlineExceeded, err.to_string()));
        }
        match &self.token {
            Some(expected) if call.token.as_deref() != Some(expected.as_str()) => {
                Err(Status::unauthenticated("missing or invalid bearer token"))
            }
            _ => Ok(()),
        }
    }

    fn with_transaction<T>(
        &self,
        handle: &Bytes,
        f: impl FnOnce(&mut EngineTransaction) -> Result<T, EngineError>,
    ) -> Result<T, Status> {
        let mut transactions = self.transactions.lock();
        let txn = transactions
            .get_mut(handle)
            .ok_or_else(|| Status::invalid_argument("unknown transaction"))?;
        f(txn).map_err(status)
    }

    fn entity_result(&self, key: &Key, properties: &PropertyList, project_id: &str) -> EntityResult {
        EntityResult {
            entity: WireEntity::from_properties(Some(key), properties, project_id),
            version: self.engine.version(key),
            cursor: None,
        }
    }
}

impl RemoteService for LoopbackService {
    fn lookup(&self, call: &Call<'_>, req: LookupRequest) -> Result<LookupResponse, Status> {
        self.accept(call)?;
        let mut wire_keys = req.keys;
        let deferred = if wire_keys.len() > self.lookup_limit {
            wire_keys.split_off(self.lookup_limit)
        } else {
            Vec::new()
        };
        let keys = wire_keys
            .iter()
            .map(client_key)
            .collect::<Result<Vec<_>, _>>()?;

        let found = match &req.read_options.transaction {
            Some(handle) => self.with_transaction(handle, |txn| self.engine.get_in(txn, &keys))?,
            None => self.engine.get(&keys).map_err(status)?,
        };

        let mut response = LookupResponse {
            deferred,
            ..LookupResponse::default()
        };
        for (key, entity) in keys.iter().zip(found) {
            match entity {
                Some(properties) => response
                    .found
                    .push(self.entity_result(key, &properties, &req.project_id)),
                None => response
                    .missing
                    .push(self.entity_result(key, &PropertyList::new(), &req.project_id)),
            }
        }
        Ok(response)
    }

    fn run_query(&self, call: &Call<'_>, req: RunQueryRequest) -> Result<RunQueryResponse, Status> {
        self.accept(call)?;
        let query = req
            .query
            .to_query(&req.partition_id.namespace_id)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let page_limit = i32::try_from(self.page_limit).unwrap_or(i32::MAX);
        let capped = req.query.limit.map_or(true, |limit| limit > page_limit);
        let query = if capped { query.limit(page_limit) } else { query };

        let rows = match &req.read_options.transaction {
            Some(handle) => self.with_transaction(handle, |txn| self.engine.run_in(txn, &query))?,
            None => self.engine.run(&query).map_err(status)?,
        };

        let start = query
            .start_cursor()
            .map(cursor_position)
            .transpose()
            .map_err(status)?
            .unwrap_or(0);
        let skipped = rows.start_position.saturating_sub(start);
        let entity_result_type = if query.is_keys_only() {
            ResultType::KeyOnly
        } else if query.projection().is_empty() {
            ResultType::Full
        } else {
            ResultType::Projection
        };
        let more_results = match (rows.more, capped) {
            (true, true) => MoreResults::NotFinished,
            (true, false) => MoreResults::MoreResultsAfterLimit,
            (false, _) if query.end_cursor().is_some() => MoreResults::MoreResultsAfterCursor,
            (false, _) => MoreResults::NoMoreResults,
        };
        let entity_results = rows
            .rows
            .iter()
            .map(|row| EntityResult {
                cursor: Some(bytes_of(&row.cursor_after())),
                ..self.entity_result(&row.key, &row.properties, &req.project_id)
            })
            .collect();

        Ok(RunQueryResponse {
            batch: QueryResultBatch {
                entity_result_type,
                entity_results,
                skipped_results: i32::try_from(skipped).unwrap_or(i32::MAX),
                skipped_cursor: Some(bytes_of(&position_cursor(rows.start_position))),
                end_cursor: bytes_of(&rows.cursor_at(rows.rows.len())),
                more_results,
            },
        })
    }

    fn begin_transaction(
        &self,
        call: &Call<'_>,
        _req: BeginTransactionRequest,
    ) -> Result<BeginTransactionResponse, Status> {
        self.accept(call)?;
        let txn = self.engine.begin().map_err(status)?;
        let handle = Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        trace!(transaction = %txn.id(), "loopback transaction begun");
        self.transactions.lock().insert(handle.clone(), txn);
        Ok(BeginTransactionResponse {
            transaction: handle,
        })
    }

    fn commit(&self, call: &Call<'_>, req: CommitRequest) -> Result<CommitResponse, Status> {
        self.accept(call)?;
        let mut txn = match (req.mode, &req.transaction) {
            (CommitMode::Transactional, Some(handle)) => self
                .transactions
                .lock()
                .remove(handle)
                .ok_or_else(|| Status::invalid_argument("unknown transaction"))?,
            (CommitMode::Transactional, None) => {
                return Err(Status::invalid_argument("transactional commit without a transaction"));
            }
            (CommitMode::NonTransactional, _) => self.engine.begin_blind().map_err(status)?,
        };

        let mut slots = Vec::with_capacity(req.mutations.len());
        let mut index_updates = 0u32;
        for mutation in req.mutations {
            match mutation {
                Mutation::Upsert(entity) => {
                    let key = entity
                        .key
                        .as_ref()
                        .ok_or_else(|| Status::invalid_argument(format!("{INVALID_KEY_PREFIX}: upsert without key")))
                        .and_then(client_key)?;
                    let properties = entity
                        .to_properties()
                        .map_err(|err| Status::invalid_argument(err.to_string()))?;
                    index_updates += properties.iter().filter(|p| !p.no_index).count() as u32;
                    let pending = self
                        .engine
                        .put_in(&mut txn, &[key], vec![properties])
                        .map_err(status)?;
                    slots.push(pending.first().map(|p| p.slot()));
                }
                Mutation::Delete(key) => {
                    let key = client_key(&key)?;
                    self.engine.delete_in(&mut txn, &[key]).map_err(status)?;
                    slots.push(None);
                }
            }
        }

        let commit = self.engine.commit(&mut txn).map_err(status)?;
        let version = self.engine.committed_seq();
        let mutation_results = slots
            .into_iter()
            .map(|slot| MutationResult {
                key: slot
                    .and_then(|s| commit.keys().get(s))
                    .map(|k| WireKey::from_key(k, &req.project_id)),
                version,
            })
            .collect();
        Ok(CommitResponse {
            mutation_results,
            index_updates,
        })
    }

    fn rollback(&self, call: &Call<'_>, req: RollbackRequest) -> Result<(), Status> {
        self.accept(call)?;
        let mut txn = self
            .transactions
            .lock()
            .remove(&req.transaction)
            .ok_or_else(|| Status::invalid_argument("unknown transaction"))?;
        self.engine.rollback(&mut txn).map_err(status)
    }

    fn allocate_ids(&self, call: &Call<'_>, req: AllocateIdsRequest) -> Result<AllocateIdsResponse, Status> {
        self.accept(call)?;
        let keys = req
            .keys
            .iter()
            .map(client_key)
            .collect::<Result<Vec<_>, _>>()?;
        let allocated = self.engine.allocate_ids(&keys).map_err(status)?;
        Ok(AllocateIdsResponse {
            keys: allocated
                .iter()
                .map(|k| WireKey::from_key(k, &req.project_id))
                .collect(),
        })
    }
}
