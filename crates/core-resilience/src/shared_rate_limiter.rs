//! Fixed-window rate limiter backed by a shared counter store
//!
//! Each resource maps to one counter key. The first increment of a window
//! sets the key's expiry to the window length; a call is admitted while the
//! counter stays at or below `max_permits`.
//!
//! If the store cannot be reached the limiter fails open: the call is
//! admitted and a warning is logged.

use crate::counter_store::CounterStore;
use crate::error::ResilienceError;
use crate::events::{EventSink, Gate, ResilienceEvent, TracingSink};
use crate::rate_limiter::{RateLimitRule, RateLimiter, DEFAULT_POLL_INTERVAL};
use crate::sync::{read, write};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Prefix of every counter key
pub const DEFAULT_KEY_PREFIX: &str = "rampart:ratelimit:";

/// Rate limiter sharing its counters through a [`CounterStore`]
#[derive(Clone)]
pub struct SharedRateLimiter {
    store: Arc<dyn CounterStore>,
    rules: Arc<RwLock<HashMap<String, RateLimitRule>>>,
    key_prefix: String,
    poll_interval: Duration,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for SharedRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("rules", &*read(&self.rules))
            .finish()
    }
}

impl SharedRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            rules: Arc::new(RwLock::new(HashMap::new())),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            sink: Arc::new(TracingSink),
        }
    }

    /// Namespace keys, e.g. per deployment
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Store key holding the counter for `resource`
    pub fn key(&self, resource: &str) -> String {
        format!("{}{}", self.key_prefix, resource)
    }
}

#[async_trait]
impl RateLimiter for SharedRateLimiter {
    async fn try_acquire(&self, resource: &str, permits: u32) -> bool {
        let Some(rule) = self.rule(resource) else {
            return true;
        };

        let key = self.key(resource);
        match self
            .store
            .increment_with_ttl(&key, u64::from(permits), rule.window)
            .await
        {
            Ok(count) if count <= rule.max_permits => true,
            Ok(count) => {
                tracing::debug!(resource = %resource, count, max = rule.max_permits, "shared quota exhausted");
                self.sink.record(&ResilienceEvent::Rejected {
                    resource: resource.to_string(),
                    gate: Gate::RateLimiter,
                });
                false
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "counter store unavailable, admitting request");
                true
            }
        }
    }

    fn configure(&self, resource: &str, rule: RateLimitRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        write(&self.rules).insert(resource.to_string(), rule);
        Ok(())
    }

    fn rule(&self, resource: &str) -> Option<RateLimitRule> {
        read(&self.rules).get(resource).copied()
    }

    async fn available_permits(&self, resource: &str) -> Option<u64> {
        let rule = self.rule(resource)?;
        match self.store.get(&self.key(resource)).await {
            Ok(count) => Some(rule.max_permits.saturating_sub(count.unwrap_or(0))),
            Err(e) => {
                warn!(resource = %resource, error = %e, "failed to read shared counter");
                None
            }
        }
    }

    async fn retry_after(&self, resource: &str) -> Option<Duration> {
        self.rule(resource)?;
        self.store.ttl(&self.key(resource)).await.ok().flatten()
    }

    async fn reset(&self, resource: &str) {
        if let Err(e) = self.store.delete(&self.key(resource)).await {
            warn!(resource = %resource, error = %e, "failed to reset shared counter");
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::InMemoryCounterStore;

    fn limiter_with(store: Arc<InMemoryCounterStore>) -> SharedRateLimiter {
        let limiter = SharedRateLimiter::new(store);
        limiter
            .configure("api", RateLimitRule::new(2, Duration::from_secs(1)))
            .unwrap();
        limiter
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_quota_across_instances() {
        let store = Arc::new(InMemoryCounterStore::new());
        let a = limiter_with(store.clone());
        let b = limiter_with(store.clone());

        assert!(a.try_acquire("api", 1).await);
        assert!(b.try_acquire("api", 1).await);
        assert!(!a.try_acquire("api", 1).await);
        assert!(!b.try_acquire("api", 1).await);
        assert_eq!(a.available_permits("api").await, Some(0));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire("api", 1).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter_with(store.clone());
        store.set_unavailable(true);

        for _ in 0..10 {
            assert!(limiter.try_acquire("api", 1).await);
        }
        assert_eq!(limiter.available_permits("api").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_key_ttl() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter_with(store);

        assert_eq!(limiter.retry_after("api").await, None);
        assert!(limiter.try_acquire("api", 1).await);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(
            limiter.retry_after("api").await,
            Some(Duration::from_millis(750))
        );
    }

    #[tokio::test]
    async fn test_key_prefix_and_reset() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter_with(store.clone()).with_key_prefix("svc:");
        assert_eq!(limiter.key("api"), "svc:api");

        assert!(limiter.try_acquire("api", 2).await);
        assert_eq!(store.get("svc:api").await.unwrap(), Some(2));

        limiter.reset("api").await;
        assert_eq!(store.get("svc:api").await.unwrap(), None);
        assert_eq!(limiter.available_permits("api").await, Some(2));
    }

    #[tokio::test]
    async fn test_unconfigured_resource_bypasses_store() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = SharedRateLimiter::new(store.clone());
        assert!(limiter.try_acquire("other", 1).await);
        assert!(store.is_empty());
    }
}
