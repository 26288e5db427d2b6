//! A middleware recording the traffic that passes through it.

use dsclient_codec::{Commit, DsResult, Key, PendingKey, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo, Transaction};
use dsclient_storage::RawIterator;
use parking_lot::Mutex;
use std::sync::Arc;

/// Whether an entry was written before or after forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the call was forwarded.
    Before,
    /// After the forwarded call returned.
    After,
}

/// One observed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Name of the recording middleware.
    pub middleware: String,
    /// Operation name, e.g. `PutMultiWithoutTx`.
    pub op: &'static str,
    /// Call phase.
    pub phase: Phase,
    /// Number of keys in the call, zero for key-less operations.
    pub len: usize,
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Before => "before",
            Phase::After => "after",
        };
        write!(f, "{}.{}.{}", self.middleware, self.op, phase)
    }
}

/// Shared log that several recording middlewares write to.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A middleware writing to this recorder under `name`.
    pub fn middleware(&self, name: impl Into<String>) -> Arc<RecordingMiddleware> {
        Arc::new(RecordingMiddleware {
            name: name.into(),
            recorder: self.clone(),
        })
    }

    /// Every entry so far, in order.
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().clone()
    }

    /// Entries rendered as `name.op.phase`.
    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().map(ToString::to_string).collect()
    }

    /// Key counts of the calls `op` made through the middleware `name`.
    pub fn lengths(&self, name: &str, op: &str) -> Vec<usize> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.middleware == name && e.op == op && e.phase == Phase::Before)
            .map(|e| e.len)
            .collect()
    }

    /// Number of `op` calls seen by the middleware `name`.
    pub fn calls(&self, name: &str, op: &str) -> usize {
        self.lengths(name, op).len()
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn push(&self, middleware: &str, op: &'static str, phase: Phase, len: usize) {
        self.entries.lock().push(Entry {
            middleware: middleware.to_string(),
            op,
            phase,
            len,
        });
    }
}

/// Middleware that records each call and forwards it unchanged.
#[derive(Debug)]
pub struct RecordingMiddleware {
    name: String,
    recorder: Recorder,
}

impl RecordingMiddleware {
    /// The recorder this middleware writes to.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    fn around<T>(&self, op: &'static str, len: usize, f: impl FnOnce() -> T) -> T {
        self.recorder.push(&self.name, op, Phase::Before, len);
        let out = f();
        self.recorder.push(&self.name, op, Phase::After, len);
        out
    }
}

impl Middleware for RecordingMiddleware {
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        self.around("AllocateIds", keys.len(), || info.next.allocate_ids(info, keys))
    }

    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        self.around("PutMultiWithoutTx", keys.len(), || {
            info.next.put_multi_without_tx(info, keys, entities)
        })
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        self.around("PutMultiWithTx", keys.len(), || {
            info.next.put_multi_with_tx(info, keys, entities)
        })
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        self.around("GetMultiWithoutTx", keys.len(), || {
            info.next.get_multi_without_tx(info, keys, dst)
        })
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.around("GetMultiWithTx", keys.len(), || {
            info.next.get_multi_with_tx(info, keys, dst)
        })
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.around("DeleteMultiWithoutTx", keys.len(), || {
            info.next.delete_multi_without_tx(info, keys)
        })
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.around("DeleteMultiWithTx", keys.len(), || {
            info.next.delete_multi_with_tx(info, keys)
        })
    }

    fn post_commit(&self, info: &MiddlewareInfo, tx: &Transaction, commit: &Commit) -> DsResult<()> {
        self.around("PostCommit", 0, || info.next.post_commit(info, tx, commit))
    }

    fn post_rollback(&self, info: &MiddlewareInfo, tx: &Transaction) -> DsResult<()> {
        self.around("PostRollback", 0, || info.next.post_rollback(info, tx))
    }

    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        self.around("Run", 0, || info.next.run(info, query))
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        self.around("GetAll", 0, || info.next.get_all(info, query, dst))
    }

    fn next(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        iter: &mut dyn RawIterator,
        dst: &mut PropertyList,
    ) -> DsResult<Key> {
        self.around("Next", 0, || info.next.next(info, query, iter, dst))
    }

    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        self.around("Count", 0, || info.next.count(info, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestClient;
    use crate::records::{data_key, Data};

    #[test]
    fn records_before_and_after() {
        let tc = TestClient::embedded();
        let recorder = Recorder::new();
        tc.append_middleware(recorder.middleware("rec"));

        tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();
        assert_eq!(
            recorder.lines(),
            vec!["rec.PutMultiWithoutTx.before", "rec.PutMultiWithoutTx.after"]
        );
        assert_eq!(recorder.lengths("rec", "PutMultiWithoutTx"), vec![1]);

        recorder.clear();
        assert!(recorder.entries().is_empty());
    }
}
