//! The availability runtime
//!
//! One [`AvailabilityRuntime`] owns every per-resource map: rate limits,
//! circuit breakers, bulkheads, retry and timeout policies, fallbacks and
//! degradation flags. Build it once at startup and share it (usually as an
//! `Arc`) with the [`AvailabilityOrchestrator`](crate::AvailabilityOrchestrator)
//! and anything that needs to inspect it, such as a health endpoint.
//!
//! Every component reports to the runtime's [`KernelMetrics`] and waits on
//! the runtime's shutdown token.

use rampart_core_resilience::{
    BackoffStrategy, Bulkhead, BulkheadRule, CircuitBreakerRegistry, CircuitBreakerRule,
    CounterStore, DegradationSwitch, EventSink, FallbackRegistry, LocalRateLimiter, RateLimitRule,
    RateLimiter, ResilienceError, RetryExecutor, RetryPolicy, SharedRateLimiter, TimeoutExecutor,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{KernelConfig, ResourceConfig};
use crate::error::{RampartError, Result};
use crate::metrics::KernelMetrics;

/// Point-in-time view of one resource across every gate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub resource: String,
    pub circuit_state: String,
    pub circuit_successes: u32,
    pub circuit_failures: u32,
    pub circuit_rejections: u32,
    pub bulkhead_active: usize,
    pub bulkhead_available: usize,
    pub bulkhead_waiting: usize,
    /// Permits left in the current rate-limit window, `None` when unlimited or unknown
    pub permits_available: Option<u64>,
    pub degraded: bool,
    pub timeout_ms: u64,
}

/// Owner of all availability state for one process
pub struct AvailabilityRuntime {
    rate_limiter: Arc<dyn RateLimiter>,
    circuit_breakers: CircuitBreakerRegistry,
    bulkhead: Bulkhead,
    retry: RetryExecutor,
    timeout: TimeoutExecutor,
    fallbacks: FallbackRegistry,
    degradation: DegradationSwitch,
    metrics: Arc<KernelMetrics>,
    shutdown: CancellationToken,
    known_resources: RwLock<BTreeSet<String>>,
}

impl std::fmt::Debug for AvailabilityRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityRuntime")
            .field("circuit_breakers", &self.circuit_breakers)
            .field("bulkhead", &self.bulkhead)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("degradation", &self.degradation)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AvailabilityRuntime {
    /// Runtime with default rules and an in-process rate limiter
    pub fn new() -> Result<Self> {
        Self::from_config(&KernelConfig::default())
    }

    /// Runtime built from `config`, with an in-process rate limiter
    pub fn from_config(config: &KernelConfig) -> Result<Self> {
        let metrics = Arc::new(KernelMetrics::new()?);
        let limiter = LocalRateLimiter::new()
            .with_sink(metrics.clone())
            .with_poll_interval(config.defaults.acquire_poll_interval());
        Self::assemble(config, Arc::new(limiter), metrics)
    }

    /// Runtime whose rate limits are shared with other processes through `store`
    pub fn shared_from_config(config: &KernelConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let metrics = Arc::new(KernelMetrics::new()?);
        let limiter = SharedRateLimiter::new(store)
            .with_sink(metrics.clone())
            .with_poll_interval(config.defaults.acquire_poll_interval());
        Self::assemble(config, Arc::new(limiter), metrics)
    }

    /// Runtime using a caller-supplied rate limiter
    pub fn with_rate_limiter(config: &KernelConfig, limiter: Arc<dyn RateLimiter>) -> Result<Self> {
        let metrics = Arc::new(KernelMetrics::new()?);
        Self::assemble(config, limiter, metrics)
    }

    fn assemble(
        config: &KernelConfig,
        rate_limiter: Arc<dyn RateLimiter>,
        metrics: Arc<KernelMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let sink: Arc<dyn EventSink> = metrics.clone();
        let defaults = &config.defaults;

        let retry_policy = defaults.retry.to_policy()?;
        let runtime = Self {
            rate_limiter,
            circuit_breakers: CircuitBreakerRegistry::new(defaults.circuit_breaker.to_rule())
                .with_sink(sink.clone()),
            bulkhead: Bulkhead::new(defaults.bulkhead.to_rule())
                .with_sink(sink.clone())
                .with_cancellation(shutdown.clone()),
            retry: RetryExecutor::new(retry_policy)
                .with_sink(sink.clone())
                .with_cancellation(shutdown.clone()),
            timeout: TimeoutExecutor::new(defaults.timeout())
                .with_sink(sink.clone())
                .with_cancellation(shutdown.clone()),
            fallbacks: FallbackRegistry::new().with_sink(sink),
            degradation: DegradationSwitch::new(),
            metrics,
            shutdown,
            known_resources: RwLock::new(BTreeSet::new()),
        };

        for (name, resource) in &config.resources {
            runtime.apply_resource(name, resource)?;
        }

        tracing::info!(
            resources = config.resources.len(),
            "availability runtime initialized"
        );
        Ok(runtime)
    }

    /// Apply every override in `resource` to `name`
    pub fn apply_resource(&self, name: &str, resource: &ResourceConfig) -> Result<()> {
        self.remember(name);
        if let Some(rate_limit) = &resource.rate_limit {
            self.rate_limiter.configure(name, rate_limit.to_rule())?;
        }
        if let Some(cb) = &resource.circuit_breaker {
            self.circuit_breakers.configure(name, cb.to_rule())?;
        }
        if let Some(retry) = &resource.retry {
            self.retry.configure(name, retry.to_policy()?)?;
        }
        if let Some(bulkhead) = &resource.bulkhead {
            self.bulkhead.configure(name, bulkhead.to_rule())?;
        }
        if let Some(timeout_ms) = resource.timeout_ms {
            self.timeout.configure(name, Duration::from_millis(timeout_ms))?;
        }
        if let Some(strategy) = resource.fallback_strategy()? {
            self.fallbacks.set_strategy(name, strategy);
        }
        if resource.degraded {
            self.degradation.mark_degraded(name);
        }
        Ok(())
    }

    fn remember(&self, resource: &str) {
        let mut known = self
            .known_resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !known.contains(resource) {
            known.insert(resource.to_string());
        }
    }

    /// Set the fixed-window quota for `resource`
    pub fn configure_rate_limit(&self, resource: &str, permits: u64, window: Duration) -> Result<()> {
        self.remember(resource);
        self.rate_limiter
            .configure(resource, RateLimitRule::new(permits, window))?;
        Ok(())
    }

    /// Set the breaker rule for `resource`
    pub fn configure_circuit_breaker(
        &self,
        resource: &str,
        failure_ratio: f64,
        volume_threshold: u32,
        open_duration: Duration,
        success_threshold: u32,
    ) -> Result<()> {
        self.remember(resource);
        self.circuit_breakers.configure(
            resource,
            CircuitBreakerRule::new(failure_ratio, volume_threshold, open_duration, success_threshold),
        )?;
        Ok(())
    }

    /// Set retry count, first delay and backoff strategy for `resource`
    pub fn configure_retry(
        &self,
        resource: &str,
        max_retries: u32,
        delay: Duration,
        strategy: BackoffStrategy,
    ) -> Result<()> {
        self.remember(resource);
        self.retry
            .configure_simple(resource, max_retries, delay, strategy)?;
        Ok(())
    }

    /// Set a complete retry policy for `resource`
    pub fn configure_retry_policy(&self, resource: &str, policy: RetryPolicy) -> Result<()> {
        self.remember(resource);
        self.retry.configure(resource, policy)?;
        Ok(())
    }

    /// Set the deadline for `resource`
    pub fn configure_timeout(&self, resource: &str, timeout: Duration) -> Result<()> {
        self.remember(resource);
        self.timeout.configure(resource, timeout)?;
        Ok(())
    }

    /// Set the concurrency limit for `resource`, keeping its wait timeout
    pub fn configure_bulkhead(
        &self,
        resource: &str,
        max_concurrent: usize,
        queue_capacity: usize,
    ) -> Result<()> {
        let wait_timeout = self.bulkhead.rule(resource).wait_timeout;
        self.configure_bulkhead_rule(
            resource,
            BulkheadRule::new(max_concurrent, queue_capacity, wait_timeout),
        )
    }

    /// Set a complete bulkhead rule for `resource`
    pub fn configure_bulkhead_rule(&self, resource: &str, rule: BulkheadRule) -> Result<()> {
        self.remember(resource);
        self.bulkhead.configure(resource, rule)?;
        Ok(())
    }

    /// Wait up to `max_wait` for rate-limit permits
    pub async fn acquire_permits(
        &self,
        resource: &str,
        permits: u32,
        max_wait: Duration,
    ) -> std::result::Result<(), ResilienceError> {
        self.rate_limiter
            .acquire(resource, permits, max_wait, &self.shutdown)
            .await
    }

    pub fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn timeout(&self) -> &TimeoutExecutor {
        &self.timeout
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    pub fn degradation(&self) -> &DegradationSwitch {
        &self.degradation
    }

    pub fn metrics(&self) -> &KernelMetrics {
        &self.metrics
    }

    /// Sink every component reports to
    pub fn sink(&self) -> &dyn EventSink {
        self.metrics.as_ref()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wake every blocked waiter with [`ResilienceError::Cancelled`]
    ///
    /// Calls made afterwards fail as soon as they would wait.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("availability runtime shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current state of `resource` across every gate
    pub async fn snapshot(&self, resource: &str) -> ResourceSnapshot {
        let stats = self.circuit_breakers.stats(resource);
        ResourceSnapshot {
            resource: resource.to_string(),
            circuit_state: self.circuit_breakers.state(resource).to_string(),
            circuit_successes: stats.as_ref().map_or(0, |s| s.success_count),
            circuit_failures: stats.as_ref().map_or(0, |s| s.failure_count),
            circuit_rejections: stats.as_ref().map_or(0, |s| s.rejected_count),
            bulkhead_active: self.bulkhead.active_count(resource),
            bulkhead_available: self.bulkhead.available_slots(resource),
            bulkhead_waiting: self.bulkhead.waiting_count(resource),
            permits_available: self.rate_limiter.available_permits(resource).await,
            degraded: self.degradation.is_degraded(resource),
            timeout_ms: u64::try_from(self.timeout.timeout_for(resource).as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Snapshots of every resource the runtime knows about, sorted by name
    pub async fn health_report(&self) -> Vec<ResourceSnapshot> {
        let mut names: BTreeSet<String> = self
            .known_resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        names.extend(self.circuit_breakers.resources());
        names.extend(self.bulkhead.resources());
        names.extend(self.degradation.degraded_resources());

        let mut report = Vec::with_capacity(names.len());
        for name in names {
            report.push(self.snapshot(&name).await);
        }
        report
    }

    /// [`health_report`](Self::health_report) as JSON
    pub async fn health_report_json(&self) -> Result<String> {
        let report = self.health_report().await;
        serde_json::to_string_pretty(&report)
            .map_err(|e| RampartError::Config(format!("Failed to serialize health report: {}", e)))
    }
}
