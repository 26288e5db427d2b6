//! Operation logging.

use dsclient_codec::{Commit, DsResult, Key, PendingKey, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo, Transaction};
use dsclient_storage::RawIterator;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Receives each formatted log line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for [`LoggingMiddleware`].
#[derive(Clone, Default)]
pub struct LoggingConfig {
    /// Prepended to every line.
    pub prefix: String,

    /// Extra destination for the lines, besides `tracing`.
    pub sink: Option<LogSink>,
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("prefix", &self.prefix)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl LoggingConfig {
    /// Creates a configuration with no prefix and no sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the line prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets a sink receiving every line.
    #[must_use]
    pub fn sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Logs every operation before and after it is forwarded.
///
/// Each call gets a sequence number shared by its before and after lines:
///
/// ```text
/// PutMultiWithoutTx #3, len(keys)=2, keys=[/Data,1, /Data,2]
/// PutMultiWithoutTx #3, keys=[/Data,1, /Data,2]
/// ```
///
/// Failures are logged as `err=...` in the after line.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    config: LoggingConfig,
    counter: AtomicU64,
}

impl LoggingMiddleware {
    /// Creates a logging middleware.
    #[must_use]
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    fn log(&self, line: fmt::Arguments<'_>) {
        let line = format!("{}{}", self.config.prefix, line);
        debug!(target: "dsclient::log", "{line}");
        if let Some(sink) = &self.config.sink {
            sink(&line);
        }
    }

    fn seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn after<T>(&self, op: &str, seq: u64, result: &DsResult<T>, ok: impl FnOnce(&T) -> String) {
        match result {
            Ok(value) => {
                let detail = ok(value);
                if detail.is_empty() {
                    self.log(format_args!("{op} #{seq}, ok"));
                } else {
                    self.log(format_args!("{op} #{seq}, {detail}"));
                }
            }
            Err(err) => self.log(format_args!("{op} #{seq}, err={err}")),
        }
    }
}

fn keys_to_string(keys: &[Key]) -> String {
    keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl Middleware for LoggingMiddleware {
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        let seq = self.seq();
        self.log(format_args!("AllocateIDs #{seq}, len(keys)={}, keys=[{}]", keys.len(), keys_to_string(keys)));
        let result = info.next.allocate_ids(info, keys);
        self.after("AllocateIDs", seq, &result, |keys| format!("keys=[{}]", keys_to_string(keys)));
        result
    }

    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        let seq = self.seq();
        self.log(format_args!(
            "PutMultiWithoutTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.put_multi_without_tx(info, keys, entities);
        self.after("PutMultiWithoutTx", seq, &result, |keys| format!("keys=[{}]", keys_to_string(keys)));
        result
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        let seq = self.seq();
        self.log(format_args!(
            "PutMultiWithTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.put_multi_with_tx(info, keys, entities);
        self.after("PutMultiWithTx", seq, &result, |pending| format!("len(pending)={}", pending.len()));
        result
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!(
            "GetMultiWithoutTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.get_multi_without_tx(info, keys, dst);
        self.after("GetMultiWithoutTx", seq, &result, |_| String::new());
        result
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!(
            "GetMultiWithTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.get_multi_with_tx(info, keys, dst);
        self.after("GetMultiWithTx", seq, &result, |_| String::new());
        result
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!(
            "DeleteMultiWithoutTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.delete_multi_without_tx(info, keys);
        self.after("DeleteMultiWithoutTx", seq, &result, |_| String::new());
        result
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!(
            "DeleteMultiWithTx #{seq}, len(keys)={}, keys=[{}]",
            keys.len(),
            keys_to_string(keys)
        ));
        let result = info.next.delete_multi_with_tx(info, keys);
        self.after("DeleteMultiWithTx", seq, &result, |_| String::new());
        result
    }

    fn post_commit(&self, info: &MiddlewareInfo, tx: &Transaction, commit: &Commit) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!("PostCommit #{seq}, {}", tx.id()));
        let result = info.next.post_commit(info, tx, commit);
        self.after("PostCommit", seq, &result, |_| String::new());
        result
    }

    fn post_rollback(&self, info: &MiddlewareInfo, tx: &Transaction) -> DsResult<()> {
        let seq = self.seq();
        self.log(format_args!("PostRollback #{seq}, {}", tx.id()));
        let result = info.next.post_rollback(info, tx);
        self.after("PostRollback", seq, &result, |_| String::new());
        result
    }

    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        let seq = self.seq();
        self.log(format_args!("Run #{seq}, q={}", query.dump().fingerprint()));
        let result = info.next.run(info, query);
        self.after("Run", seq, &result, |_| String::new());
        result
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        let seq = self.seq();
        self.log(format_args!("GetAll #{seq}, q={}", query.dump().fingerprint()));
        let result = info.next.get_all(info, query, dst);
        self.after("GetAll", seq, &result, |keys| format!("len(keys)={}", keys.len()));
        result
    }

    fn next(
        &self,
        info: &MiddlewareInfo,
        query: &Query,
        iter: &mut dyn RawIterator,
        dst: &mut PropertyList,
    ) -> DsResult<Key> {
        let seq = self.seq();
        self.log(format_args!("Next #{seq}, q={}", query.dump().fingerprint()));
        let result = info.next.next(info, query, iter, dst);
        match &result {
            Err(err) if err.is_done() => self.log(format_args!("Next #{seq}, done")),
            _ => self.after("Next", seq, &result, |key| format!("key={key}")),
        }
        result
    }

    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        let seq = self.seq();
        self.log(format_args!("Count #{seq}, q={}", query.dump().fingerprint()));
        let result = info.next.count(info, query);
        self.after("Count", seq, &result, |n| format!("ret={n}"));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::Context;
    use dsclient_testkit::{data_key, Data, TestClient};
    use parking_lot::Mutex;

    fn capture(prefix: &str) -> (Arc<LoggingMiddleware>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let config = LoggingConfig::new()
            .prefix(prefix)
            .sink(Arc::new(move |line: &str| sink_lines.lock().push(line.to_string())));
        (Arc::new(LoggingMiddleware::new(config)), lines)
    }

    #[test]
    fn logs_numbered_before_and_after_lines() {
        let tc = TestClient::embedded();
        let (logger, lines) = capture("log: ");
        tc.append_middleware(logger);

        tc.put(&tc.ctx, &data_key(1), &Data::named("a")).unwrap();
        let mut missing = Data::default();
        tc.get(&tc.ctx, &data_key(2), &mut missing).unwrap_err();

        let lines = lines.lock().clone();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "log: PutMultiWithoutTx #1, len(keys)=1, keys=[/Data,1]");
        assert_eq!(lines[1], "log: PutMultiWithoutTx #1, keys=[/Data,1]");
        assert_eq!(lines[2], "log: GetMultiWithoutTx #2, len(keys)=1, keys=[/Data,2]");
        assert!(lines[3].starts_with("log: GetMultiWithoutTx #2, err="));
    }

    #[test]
    fn logs_transaction_hooks() {
        let tc = TestClient::embedded();
        let (logger, lines) = capture("");
        tc.append_middleware(logger);

        let tx = tc.new_transaction(&Context::background()).unwrap();
        tx.put(&tc.incomplete_key("Data", None), &Data::named("a")).unwrap();
        tx.commit().unwrap();

        let lines = lines.lock().clone();
        assert!(lines.iter().any(|l| l.starts_with("PutMultiWithTx #1, len(keys)=1")));
        assert!(lines.iter().any(|l| l.starts_with("PostCommit #2, ")));
        assert_eq!(lines.last().map(String::as_str), Some("PostCommit #2, ok"));
    }
}
