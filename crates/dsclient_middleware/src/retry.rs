//! Retrying failed calls with exponential backoff.

use dsclient_codec::{Context, DsError, DsResult, Key, PendingKey, PropertyList, Query};
use dsclient_core::{Middleware, MiddlewareInfo};
use dsclient_storage::RawIterator;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Decides whether an error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&DsError) -> bool + Send + Sync>;

/// Configuration for [`RetryMiddleware`].
#[derive(Clone)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any delay.
    pub max_backoff: Duration,

    /// Factor applied to the delay after each attempt.
    pub multiplier: f64,

    /// Randomize each delay between half and all of its value.
    pub jitter: bool,

    /// Errors for which a call is reissued.
    pub retriable: RetryPredicate,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            retriable: Arc::new(DsError::is_retriable),
        }
    }
}

impl RetryConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first delay and the delay cap.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the delay growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the retriable-error predicate.
    #[must_use]
    pub fn retriable(mut self, predicate: RetryPredicate) -> Self {
        self.retriable = predicate;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let secs = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Reissues calls that fail with a retriable error.
///
/// `Next`, `PostCommit` and `PostRollback` are forwarded once: an iterator
/// step is not idempotent and the hooks run after the fact.
#[derive(Debug, Default)]
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    /// Creates a retry middleware.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `call` until it succeeds, fails for good, or `ctx` is done.
    fn attempt<T>(&self, ctx: &Context, op: &str, mut call: impl FnMut() -> DsResult<T>) -> DsResult<T> {
        let mut attempt = 1;
        loop {
            match call() {
                Err(err) if attempt < self.config.max_attempts && (self.config.retriable)(&err) => {
                    if let Some(done) = ctx.err() {
                        debug!(op, attempt, error = %err, "context done, not retrying");
                        return Err(done);
                    }
                    let mut delay = self.config.delay(attempt);
                    if let Some(deadline) = ctx.deadline() {
                        delay = delay.min(deadline.saturating_duration_since(Instant::now()));
                    }
                    debug!(op, attempt, ?delay, error = %err, "retrying");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    if let Some(done) = ctx.err() {
                        return Err(done);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Middleware for RetryMiddleware {
    fn allocate_ids(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<Vec<Key>> {
        self.attempt(&info.context, "AllocateIDs", || info.next.allocate_ids(info, keys))
    }

    fn put_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<Key>> {
        self.attempt(&info.context, "PutMultiWithoutTx", || info.next.put_multi_without_tx(info, keys, entities))
    }

    fn put_multi_with_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        entities: &[PropertyList],
    ) -> DsResult<Vec<PendingKey>> {
        self.attempt(&info.context, "PutMultiWithTx", || info.next.put_multi_with_tx(info, keys, entities))
    }

    fn get_multi_without_tx(
        &self,
        info: &MiddlewareInfo,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> DsResult<()> {
        self.attempt(&info.context, "GetMultiWithoutTx", || {
            dst.iter_mut().for_each(|props| props.clear());
            info.next.get_multi_without_tx(info, keys, dst)
        })
    }

    fn get_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key], dst: &mut [PropertyList]) -> DsResult<()> {
        self.attempt(&info.context, "GetMultiWithTx", || {
            dst.iter_mut().for_each(|props| props.clear());
            info.next.get_multi_with_tx(info, keys, dst)
        })
    }

    fn delete_multi_without_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.attempt(&info.context, "DeleteMultiWithoutTx", || info.next.delete_multi_without_tx(info, keys))
    }

    fn delete_multi_with_tx(&self, info: &MiddlewareInfo, keys: &[Key]) -> DsResult<()> {
        self.attempt(&info.context, "DeleteMultiWithTx", || info.next.delete_multi_with_tx(info, keys))
    }

    fn run(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<Box<dyn RawIterator>> {
        self.attempt(&info.context, "Run", || info.next.run(info, query))
    }

    fn get_all(&self, info: &MiddlewareInfo, query: &Query, dst: &mut Vec<PropertyList>) -> DsResult<Vec<Key>> {
        let start = dst.len();
        self.attempt(&info.context, "GetAll", || {
            dst.truncate(start);
            info.next.get_all(info, query, dst)
        })
    }

    fn count(&self, info: &MiddlewareInfo, query: &Query) -> DsResult<usize> {
        self.attempt(&info.context, "Count", || info.next.count(info, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::ErrorCode;

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig::new()
            .backoff(Duration::from_millis(10), Duration::from_millis(35))
            .jitter(false);
        assert_eq!(config.delay(1), Duration::from_millis(10));
        assert_eq!(config.delay(2), Duration::from_millis(20));
        assert_eq!(config.delay(3), Duration::from_millis(35));
        assert_eq!(config.delay(10), Duration::from_millis(35));
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let config = RetryConfig::new().backoff(Duration::from_millis(40), Duration::from_secs(1));
        for _ in 0..50 {
            let delay = config.delay(1);
            assert!(delay >= Duration::from_micros(19_999) && delay <= Duration::from_micros(40_001));
        }
    }

    #[test]
    fn stops_on_non_retriable_errors() {
        let middleware = RetryMiddleware::new(RetryConfig::new().backoff(Duration::ZERO, Duration::ZERO));
        let mut calls = 0;
        let result: DsResult<()> = middleware.attempt(&Context::background(), "Op", || {
            calls += 1;
            Err(DsError::NoSuchEntity)
        });
        assert_eq!(result, Err(DsError::NoSuchEntity));
        assert_eq!(calls, 1);
    }

    #[test]
    fn canceled_context_stops_retrying() {
        let middleware = RetryMiddleware::new(RetryConfig::new().max_attempts(5).backoff(Duration::from_secs(10), Duration::from_secs(10)));
        let (ctx, cancel) = Context::background().with_cancel();
        let mut calls = 0;
        let started = Instant::now();
        let result: DsResult<()> = middleware.attempt(&ctx, "Op", || {
            calls += 1;
            cancel.cancel();
            Err(DsError::backend(ErrorCode::Unavailable, "down"))
        });
        assert_eq!(result, Err(DsError::Canceled));
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn backoff_never_sleeps_past_the_deadline() {
        let middleware = RetryMiddleware::new(RetryConfig::new().max_attempts(5).backoff(Duration::from_secs(10), Duration::from_secs(10)));
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let result: DsResult<()> =
            middleware.attempt(&ctx, "Op", || Err(DsError::backend(ErrorCode::Unavailable, "down")));
        assert_eq!(result, Err(DsError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
