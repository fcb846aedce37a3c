//! Retry with backoff
//!
//! A [`RetryPolicy`] decides whether a failed attempt is retried and how long
//! to wait first. [`RetryExecutor`] holds one policy per resource and runs
//! operations under it.
//!
//! Attempts are numbered from the first call; a policy with `max_retries = 3`
//! makes at most 4 calls. The wait before retry `n` (1-based) is:
//!
//! | Strategy    | Delay                    |
//! |-------------|--------------------------|
//! | Fixed       | `base`                   |
//! | Linear      | `base × n`               |
//! | Exponential | `base × 2^(n-1)`         |
//!
//! capped at `max_delay`, plus a uniform random jitter in `[0, jitter]`.
//! The first retry waits exactly `base` under every strategy, so exponential
//! waits run `base`, `2 × base`, `4 × base`, ... (`base × 2^attempt` with a
//! zero-based retry index).

use crate::error::{ErrorKind, ResilienceError};
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::fallback::recover_with;
use crate::sync::{read, write};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the wait grows between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(ResilienceError::Config(format!(
                "unknown backoff strategy '{}'",
                other
            ))),
        }
    }
}

/// Error kinds that end a retry loop immediately
pub fn default_abort_kinds() -> HashSet<ErrorKind> {
    [
        ErrorKind::CircuitOpen,
        ErrorKind::RateLimited,
        ErrorKind::BulkheadFull,
        ErrorKind::Cancelled,
        ErrorKind::Permanent,
        ErrorKind::Panicked,
        ErrorKind::Validation,
        ErrorKind::Degraded,
        ErrorKind::Config,
    ]
    .into_iter()
    .collect()
}

/// Retry configuration for one resource
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub base_delay: Duration,
    /// Upper bound on the computed wait (before jitter)
    pub max_delay: Duration,
    /// Upper bound of the random extra wait
    pub jitter: Duration,
    pub strategy: BackoffStrategy,
    /// If set, only these kinds are retried
    pub retry_on: Option<HashSet<ErrorKind>>,
    /// Kinds never retried; checked before `retry_on`
    pub abort_on: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
            strategy: BackoffStrategy::Exponential,
            retry_on: None,
            abort_on: default_abort_kinds(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            max_retries,
            base_delay,
            strategy,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only errors of these kinds
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = Some(kinds.into_iter().collect());
        self
    }

    /// Never retry errors of this kind
    pub fn abort_on(mut self, kind: ErrorKind) -> Self {
        self.abort_on.insert(kind);
        self
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::Config(
                "max_delay must be >= base_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Total calls allowed, first attempt included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Wait before retry `retry` (1-based), jitter included
    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..=jitter_ms);
        delay.saturating_add(Duration::from_millis(extra))
    }

    /// Whether `error` is worth another attempt under this policy
    pub fn should_retry(&self, error: &ResilienceError) -> bool {
        let kind = error.kind();
        if kind == ErrorKind::Cancelled || self.abort_on.contains(&kind) {
            return false;
        }
        match &self.retry_on {
            Some(allowed) => allowed.contains(&kind),
            None => true,
        }
    }
}

/// Runs operations under per-resource retry policies
#[derive(Clone)]
pub struct RetryExecutor {
    default_policy: Arc<RwLock<RetryPolicy>>,
    policies: Arc<RwLock<HashMap<String, RetryPolicy>>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("default_policy", &*read(&self.default_policy))
            .field("policies", &read(&self.policies).len())
            .finish()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryExecutor {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy: Arc::new(RwLock::new(default_policy)),
            policies: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Abort backoff sleeps when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_default_policy(&self, policy: RetryPolicy) -> Result<(), ResilienceError> {
        policy.validate()?;
        *write(&self.default_policy) = policy;
        Ok(())
    }

    /// Set the policy for `resource`
    pub fn configure(&self, resource: &str, policy: RetryPolicy) -> Result<(), ResilienceError> {
        policy.validate()?;
        write(&self.policies).insert(resource.to_string(), policy);
        Ok(())
    }

    /// Set retry count, base delay and strategy for `resource`, keeping the
    /// default policy's cap, jitter and error filters
    pub fn configure_simple(
        &self,
        resource: &str,
        max_retries: u32,
        base_delay: Duration,
        strategy: BackoffStrategy,
    ) -> Result<(), ResilienceError> {
        let mut policy = read(&self.default_policy).clone();
        policy.max_retries = max_retries;
        policy.base_delay = base_delay;
        policy.strategy = strategy;
        if policy.max_delay < base_delay {
            policy.max_delay = base_delay;
        }
        self.configure(resource, policy)
    }

    /// Policy in force for `resource`
    pub fn policy(&self, resource: &str) -> RetryPolicy {
        read(&self.policies)
            .get(resource)
            .cloned()
            .unwrap_or_else(|| read(&self.default_policy).clone())
    }

    /// Run `op` with the policy configured for `resource`
    pub async fn execute<T, F, Fut>(&self, resource: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let policy = self.policy(resource);
        self.execute_with_policy(resource, &policy, op).await
    }

    /// Run `op` with an explicit policy
    pub async fn execute_with_policy<T, F, Fut>(
        &self,
        resource: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let mut retries = 0u32;

        loop {
            let error = match op().await {
                Ok(result) => {
                    if retries > 0 {
                        tracing::debug!(resource = %resource, retries, "succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !policy.should_retry(&error) {
                return Err(error);
            }
            if retries >= policy.max_retries {
                self.sink.record(&ResilienceEvent::RetriesExhausted {
                    resource: resource.to_string(),
                    attempts: retries + 1,
                });
                return Err(error);
            }

            retries += 1;
            let delay = policy.delay_with_jitter(retries);
            self.sink.record(&ResilienceEvent::RetryScheduled {
                resource: resource.to_string(),
                attempt: retries,
                delay,
            });
            tracing::debug!(resource = %resource, attempt = retries, ?delay, error = %error, "retrying");

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ResilienceError::Cancelled {
                        resource: resource.to_string(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Like [`execute`](Self::execute), substituting `fallback` once retries are exhausted
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        resource: &str,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        FB: FnOnce(&ResilienceError) -> Result<T, ResilienceError>,
    {
        match self.execute(resource, op).await {
            Ok(result) => Ok(result),
            Err(e) => recover_with(resource, e, fallback, self.sink.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use tokio::time::Instant;

    fn transient() -> ResilienceError {
        ResilienceError::Transient("flaky".to_string())
    }

    #[test]
    fn test_delay_progressions() {
        let base = Duration::from_millis(100);

        let fixed = RetryPolicy::new(5, base, BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), base);
        assert_eq!(fixed.delay_for(4), base);

        let linear = RetryPolicy::new(5, base, BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let exponential = RetryPolicy::new(5, base, BackoffStrategy::Exponential);
        assert_eq!(exponential.delay_for(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_for(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(50, Duration::from_secs(1), BackoffStrategy::Exponential)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), BackoffStrategy::Fixed)
            .with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let delay = policy.delay_with_jitter(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_error_filters() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&transient()));
        assert!(!policy.should_retry(&ResilienceError::Permanent("no".to_string())));
        assert!(!policy.should_retry(&ResilienceError::Cancelled {
            resource: "r".to_string()
        }));

        let only_timeouts = RetryPolicy::default().retry_on([ErrorKind::Timeout]);
        assert!(!only_timeouts.should_retry(&transient()));
        assert!(only_timeouts.should_retry(&ResilienceError::Timeout {
            resource: "r".to_string(),
            timeout: Duration::from_secs(1),
            elapsed: Duration::from_secs(1),
        }));

        let abort_store = RetryPolicy::default().abort_on(ErrorKind::Store);
        assert!(!abort_store.should_retry(&ResilienceError::Store("down".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = RetryExecutor::default();
        executor
            .configure_simple("r", 3, Duration::from_millis(10), BackoffStrategy::Fixed)
            .unwrap();

        let mut calls = 0;
        let result = executor
            .execute("r", || {
                calls += 1;
                let outcome = if calls < 3 { Err(transient()) } else { Ok(calls) };
                async move { outcome }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_count_and_backoff_timing() {
        let sink = Arc::new(RecordingSink::default());
        let executor = RetryExecutor::default().with_sink(sink.clone());
        executor
            .configure_simple("r", 3, Duration::from_millis(100), BackoffStrategy::Exponential)
            .unwrap();

        let started = Instant::now();
        let mut calls = 0u32;
        let result: Result<(), _> = executor
            .execute("r", || {
                calls += 1;
                async { Err(transient()) }
            })
            .await;

        assert_eq!(result, Err(transient()));
        assert_eq!(calls, 4);
        // 100 + 200 + 400
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(800), "elapsed {:?}", elapsed);

        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            ResilienceEvent::RetriesExhausted {
                resource: "r".to_string(),
                attempts: 4
            }
        );
    }

    #[tokio::test]
    async fn test_abort_kind_is_not_retried() {
        let executor = RetryExecutor::default();
        let mut calls = 0;
        let result: Result<(), _> = executor
            .execute("r", || {
                calls += 1;
                async {
                    Err(ResilienceError::CircuitOpen {
                        resource: "r".to_string(),
                        state: crate::CircuitState::Open,
                        remaining: None,
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let executor = RetryExecutor::new(RetryPolicy::none());
        let mut calls = 0;
        let _ = executor
            .execute("r", || {
                calls += 1;
                async { Err::<(), _>(transient()) }
            })
            .await;
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy::new(
            10,
            Duration::from_secs(60),
            BackoffStrategy::Fixed,
        ))
        .with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = executor
            .execute("r", || async { Err(transient()) })
            .await;
        assert_eq!(
            result,
            Err(ResilienceError::Cancelled {
                resource: "r".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_fallback_after_exhaustion() {
        let executor = RetryExecutor::new(RetryPolicy::new(
            1,
            Duration::from_millis(1),
            BackoffStrategy::Fixed,
        ));
        let value = executor
            .execute_with_fallback("r", || async { Err(transient()) }, |_| Ok("fallback"))
            .await
            .unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_configuration() {
        let executor = RetryExecutor::default();
        assert_eq!(executor.policy("unknown"), RetryPolicy::default());

        executor
            .configure_simple("r", 7, Duration::from_millis(5), BackoffStrategy::Linear)
            .unwrap();
        let policy = executor.policy("r");
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.max_attempts(), 8);
        assert_eq!(policy.strategy, BackoffStrategy::Linear);

        let invalid = RetryPolicy::default().with_max_delay(Duration::from_millis(1));
        assert!(executor.configure("r", invalid).is_err());

        assert_eq!("Linear".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Linear);
        assert!("random".parse::<BackoffStrategy>().is_err());
    }
}
