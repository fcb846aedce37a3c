//! Rate limiting for preventing service overload
//!
//! [`RateLimiter`] is the contract every limiter implements. The bundled
//! implementations all count per resource name:
//!
//! - [`LocalRateLimiter`]: in-process fixed-window counter
//! - [`SharedRateLimiter`](crate::shared_rate_limiter::SharedRateLimiter):
//!   fixed-window counter held in an external [`CounterStore`](crate::counter_store::CounterStore)
//! - `GovernorRateLimiter` (feature `governor-impl`): token bucket
//!
//! # Fixed window
//!
//! Every check increments the resource's counter. The first increment of a
//! window starts it; once the counter exceeds `max_permits` calls are
//! rejected until the window expires and the counter drops back to zero.
//! Up to `2 × max_permits` calls can therefore be admitted across a window
//! boundary. The token-bucket limiter does not have this artifact.
//!
//! Resources without a configured rule are not limited.

use crate::error::ResilienceError;
use crate::events::{EventSink, Gate, ResilienceEvent, TracingSink};
use crate::sync::{lock, read, write};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default pause between attempts of a blocking [`RateLimiter::acquire`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Admission quota for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Maximum permits admitted per window
    pub max_permits: u64,
    /// Window length
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_permits: u64, window: Duration) -> Self {
        Self {
            max_permits,
            window,
        }
    }

    /// Create a rule with requests per second
    pub fn per_second(max_permits: u64) -> Self {
        Self::new(max_permits, Duration::from_secs(1))
    }

    /// Create a rule with requests per minute
    pub fn per_minute(max_permits: u64) -> Self {
        Self::new(max_permits, Duration::from_secs(60))
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_permits == 0 {
            return Err(ResilienceError::Config("max_permits must be > 0".to_string()));
        }
        if self.window.is_zero() {
            return Err(ResilienceError::Config("window must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Per-resource admission control
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take `permits` without waiting
    async fn try_acquire(&self, resource: &str, permits: u32) -> bool;

    /// Set the quota for `resource`; re-applying the current rule is a no-op
    fn configure(&self, resource: &str, rule: RateLimitRule) -> Result<(), ResilienceError>;

    /// Quota for `resource`, if limited
    fn rule(&self, resource: &str) -> Option<RateLimitRule>;

    /// Permits left in the current window, `None` when unknown or unlimited
    async fn available_permits(&self, resource: &str) -> Option<u64>;

    /// Time until the current window ends, if known
    async fn retry_after(&self, resource: &str) -> Option<Duration>;

    /// Forget the current window for `resource`
    async fn reset(&self, resource: &str);

    /// Pause between attempts of [`acquire`](Self::acquire)
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Non-blocking admission returning the rejection as a typed error
    async fn check(&self, resource: &str, permits: u32) -> Result<(), ResilienceError> {
        if self.try_acquire(resource, permits).await {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded {
                resource: resource.to_string(),
                retry_after: self.retry_after(resource).await,
            })
        }
    }

    /// Wait up to `max_wait` for `permits`, polling [`try_acquire`](Self::try_acquire)
    ///
    /// Returns [`ResilienceError::Cancelled`] as soon as `cancel` fires.
    async fn acquire(
        &self,
        resource: &str,
        permits: u32,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ResilienceError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled {
                    resource: resource.to_string(),
                });
            }
            if self.try_acquire(resource, permits).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ResilienceError::RateLimitExceeded {
                    resource: resource.to_string(),
                    retry_after: self.retry_after(resource).await,
                });
            }

            let nap = self.poll_interval().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ResilienceError::Cancelled {
                        resource: resource.to_string(),
                    });
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// Counter for one resource's current window
#[derive(Debug)]
struct FixedWindow {
    rule: RateLimitRule,
    count: u64,
    window_start: Option<Instant>,
}

impl FixedWindow {
    fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            count: 0,
            window_start: None,
        }
    }

    fn roll(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now.duration_since(start) >= self.rule.window {
                self.count = 0;
                self.window_start = None;
            }
        }
    }

    fn try_acquire(&mut self, permits: u64, now: Instant) -> bool {
        self.roll(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.count = self.count.saturating_add(permits);
        self.count <= self.rule.max_permits
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.roll(now);
        self.rule.max_permits.saturating_sub(self.count)
    }

    fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        self.roll(now);
        self.window_start
            .map(|start| (start + self.rule.window).saturating_duration_since(now))
    }
}

/// In-process fixed-window rate limiter
///
/// # Example
/// ```no_run
/// use rampart_core_resilience::{LocalRateLimiter, RateLimitRule, RateLimiter};
///
/// #[tokio::main]
/// async fn main() {
///     let limiter = LocalRateLimiter::new();
///     limiter.configure("search", RateLimitRule::per_second(100)).unwrap();
///
///     if limiter.try_acquire("search", 1).await {
///         // call the search backend
///     }
/// }
/// ```
#[derive(Clone)]
pub struct LocalRateLimiter {
    windows: Arc<RwLock<HashMap<String, Arc<Mutex<FixedWindow>>>>>,
    poll_interval: Duration,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("resources", &read(&self.windows).len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            poll_interval: DEFAULT_POLL_INTERVAL,
            sink: Arc::new(TracingSink),
        }
    }

    /// Route events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Pause between polls of a blocking acquire
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn window(&self, resource: &str) -> Option<Arc<Mutex<FixedWindow>>> {
        read(&self.windows).get(resource).cloned()
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn try_acquire(&self, resource: &str, permits: u32) -> bool {
        let Some(window) = self.window(resource) else {
            return true;
        };
        let admitted = lock(&window).try_acquire(u64::from(permits), Instant::now());
        if !admitted {
            self.sink.record(&ResilienceEvent::Rejected {
                resource: resource.to_string(),
                gate: Gate::RateLimiter,
            });
        }
        admitted
    }

    fn configure(&self, resource: &str, rule: RateLimitRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        let mut windows = write(&self.windows);
        match windows.get(resource) {
            Some(existing) => {
                let mut window = lock(existing);
                if window.rule != rule {
                    *window = FixedWindow::new(rule);
                }
            }
            None => {
                windows.insert(
                    resource.to_string(),
                    Arc::new(Mutex::new(FixedWindow::new(rule))),
                );
            }
        }
        Ok(())
    }

    fn rule(&self, resource: &str) -> Option<RateLimitRule> {
        self.window(resource).map(|w| lock(&w).rule)
    }

    async fn available_permits(&self, resource: &str) -> Option<u64> {
        let window = self.window(resource)?;
        let available = lock(&window).available(Instant::now());
        Some(available)
    }

    async fn retry_after(&self, resource: &str) -> Option<Duration> {
        let window = self.window(resource)?;
        let remaining = lock(&window).retry_after(Instant::now());
        remaining
    }

    async fn reset(&self, resource: &str) {
        if let Some(window) = self.window(resource) {
            let mut window = lock(&window);
            window.count = 0;
            window.window_start = None;
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Token-bucket rate limiter using governor (when feature is enabled)
///
/// Permits replenish continuously at `max_permits / window`, with a burst
/// capacity of `max_permits`, so there is no double burst at window edges.
#[cfg(feature = "governor-impl")]
pub mod governor_impl {
    use super::*;
    use governor::{
        clock::DefaultClock,
        state::{InMemoryState, NotKeyed},
        Quota, RateLimiter as GovernorLimiter,
    };
    use std::num::NonZeroU32;

    type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

    struct Bucket {
        rule: RateLimitRule,
        limiter: DirectLimiter,
    }

    fn build(rule: RateLimitRule) -> Result<Bucket, ResilienceError> {
        let burst = u32::try_from(rule.max_permits)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| ResilienceError::Config("max_permits must fit in u32 and be > 0".to_string()))?;
        let replenish = rule
            .window
            .checked_div(burst.get())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ResilienceError::Config("window too short for max_permits".to_string()))?;
        let quota = Quota::with_period(replenish)
            .ok_or_else(|| ResilienceError::Config("Invalid period".to_string()))?
            .allow_burst(burst);

        Ok(Bucket {
            rule,
            limiter: GovernorLimiter::direct(quota),
        })
    }

    /// Rate limiter wrapper using governor
    #[derive(Clone)]
    pub struct GovernorRateLimiter {
        buckets: Arc<RwLock<HashMap<String, Arc<Bucket>>>>,
        sink: Arc<dyn EventSink>,
    }

    impl Default for GovernorRateLimiter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GovernorRateLimiter {
        pub fn new() -> Self {
            Self {
                buckets: Arc::new(RwLock::new(HashMap::new())),
                sink: Arc::new(TracingSink),
            }
        }

        pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
            self.sink = sink;
            self
        }

        fn bucket(&self, resource: &str) -> Option<Arc<Bucket>> {
            read(&self.buckets).get(resource).cloned()
        }
    }

    #[async_trait]
    impl RateLimiter for GovernorRateLimiter {
        async fn try_acquire(&self, resource: &str, permits: u32) -> bool {
            let Some(bucket) = self.bucket(resource) else {
                return true;
            };
            let Some(n) = NonZeroU32::new(permits) else {
                return true;
            };
            let admitted = matches!(bucket.limiter.check_n(n), Ok(Ok(())));
            if !admitted {
                self.sink.record(&ResilienceEvent::Rejected {
                    resource: resource.to_string(),
                    gate: Gate::RateLimiter,
                });
            }
            admitted
        }

        fn configure(&self, resource: &str, rule: RateLimitRule) -> Result<(), ResilienceError> {
            rule.validate()?;
            if self.bucket(resource).is_some_and(|b| b.rule == rule) {
                return Ok(());
            }
            let bucket = build(rule)?;
            write(&self.buckets).insert(resource.to_string(), Arc::new(bucket));
            Ok(())
        }

        fn rule(&self, resource: &str) -> Option<RateLimitRule> {
            self.bucket(resource).map(|b| b.rule)
        }

        async fn available_permits(&self, _resource: &str) -> Option<u64> {
            None
        }

        async fn retry_after(&self, _resource: &str) -> Option<Duration> {
            None
        }

        async fn reset(&self, resource: &str) {
            let Some(rule) = self.rule(resource) else {
                return;
            };
            match build(rule) {
                Ok(bucket) => {
                    write(&self.buckets).insert(resource.to_string(), Arc::new(bucket));
                }
                Err(e) => tracing::warn!(resource = %resource, error = %e, "failed to rebuild token bucket"),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_burst_then_reject() {
            let limiter = GovernorRateLimiter::new();
            limiter
                .configure("api", RateLimitRule::new(3, Duration::from_secs(60)))
                .unwrap();

            for _ in 0..3 {
                assert!(limiter.try_acquire("api", 1).await);
            }
            assert!(!limiter.try_acquire("api", 1).await);
            assert!(limiter.try_acquire("unconfigured", 1).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_admits_max_then_rejects() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(3, Duration::from_secs(1)))
            .unwrap();

        assert!(limiter.try_acquire("r", 1).await);
        assert!(limiter.try_acquire("r", 1).await);
        assert!(limiter.try_acquire("r", 1).await);
        assert!(!limiter.try_acquire("r", 1).await);
        assert_eq!(limiter.available_permits("r").await, Some(0));

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(limiter.available_permits("r").await, Some(3));
        assert!(limiter.try_acquire("r", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_starts_at_first_increment() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(1, Duration::from_millis(100)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire("r", 1).await);
        assert!(!limiter.try_acquire("r", 1).await);

        let retry_after = limiter.retry_after("r").await.unwrap();
        assert_eq!(retry_after, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(limiter.retry_after("r").await, Some(Duration::from_millis(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_allows_double_burst() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(2, Duration::from_secs(1)))
            .unwrap();

        // End of the first window
        assert!(limiter.try_acquire("r", 1).await);
        tokio::time::advance(Duration::from_millis(990)).await;
        assert!(limiter.try_acquire("r", 1).await);

        // Start of the next window, 20ms later
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(limiter.try_acquire("r", 1).await);
        assert!(limiter.try_acquire("r", 1).await);
        assert!(!limiter.try_acquire("r", 1).await);
    }

    #[tokio::test]
    async fn test_unconfigured_resource_is_unlimited() {
        let limiter = LocalRateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.try_acquire("free", 1).await);
        }
        assert_eq!(limiter.available_permits("free").await, None);
        assert_eq!(limiter.rule("free"), None);
    }

    #[tokio::test]
    async fn test_multi_permit_requests() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(5, Duration::from_secs(60)))
            .unwrap();

        assert!(limiter.try_acquire("r", 3).await);
        assert!(!limiter.try_acquire("r", 3).await);
    }

    #[tokio::test]
    async fn test_check_reports_typed_rejection() {
        let sink = Arc::new(RecordingSink::default());
        let limiter = LocalRateLimiter::new().with_sink(sink.clone());
        limiter
            .configure("r", RateLimitRule::new(1, Duration::from_secs(60)))
            .unwrap();

        limiter.check("r", 1).await.unwrap();
        match limiter.check("r", 1).await {
            Err(ResilienceError::RateLimitExceeded {
                resource,
                retry_after,
            }) => {
                assert_eq!(resource, "r");
                assert!(retry_after.is_some());
            }
            other => panic!("Expected RateLimitExceeded, got {:?}", other),
        }
        assert_eq!(
            sink.events(),
            vec![ResilienceEvent::Rejected {
                resource: "r".to_string(),
                gate: Gate::RateLimiter
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_next_window() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(1, Duration::from_millis(100)))
            .unwrap();
        let cancel = CancellationToken::new();

        assert!(limiter.try_acquire("r", 1).await);
        let started = Instant::now();
        limiter
            .acquire("r", 1, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_max_wait() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(1, Duration::from_secs(60)))
            .unwrap();
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire("r", 1).await);

        let result = limiter
            .acquire("r", 1, Duration::from_millis(50), &cancel)
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancellation_is_distinguished() {
        let limiter = LocalRateLimiter::new();
        limiter
            .configure("r", RateLimitRule::new(1, Duration::from_secs(60)))
            .unwrap();
        assert!(limiter.try_acquire("r", 1).await);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = limiter
            .acquire("r", 1, Duration::from_secs(10), &cancel)
            .await;
        assert_eq!(
            result,
            Err(ResilienceError::Cancelled {
                resource: "r".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_configure_idempotent_and_reset() {
        let limiter = LocalRateLimiter::new();
        let rule = RateLimitRule::new(2, Duration::from_secs(60));
        limiter.configure("r", rule).unwrap();
        assert!(limiter.try_acquire("r", 1).await);

        // Same rule keeps the running window
        limiter.configure("r", rule).unwrap();
        assert_eq!(limiter.available_permits("r").await, Some(1));

        // A different rule starts fresh
        limiter
            .configure("r", RateLimitRule::new(5, Duration::from_secs(60)))
            .unwrap();
        assert_eq!(limiter.available_permits("r").await, Some(5));

        assert!(limiter.try_acquire("r", 5).await);
        limiter.reset("r").await;
        assert_eq!(limiter.available_permits("r").await, Some(5));
    }

    #[test]
    fn test_invalid_rules() {
        let limiter = LocalRateLimiter::new();
        assert!(limiter
            .configure("r", RateLimitRule::new(0, Duration::from_secs(1)))
            .is_err());
        assert!(limiter
            .configure("r", RateLimitRule::new(1, Duration::ZERO))
            .is_err());
    }

    #[test]
    fn test_rule_constructors() {
        assert_eq!(RateLimitRule::per_second(100).window, Duration::from_secs(1));
        assert_eq!(RateLimitRule::per_minute(60).window, Duration::from_secs(60));
        assert_eq!(RateLimitRule::per_minute(60).max_permits, 60);
    }
}
