//! Protected-call pipelines
//!
//! [`AvailabilityOrchestrator::protect`] composes every gate of an
//! [`AvailabilityRuntime`] around one operation, in this order:
//!
//! ```text
//! rate limit ─▶ circuit admission ─▶ degradation ─▶ Timeout(Retry(CircuitBreaker(op)))
//!      │                │                  │                      │
//!      └────────────────┴──────────────────┴──── fallback ◀───────┘
//! ```
//!
//! Retries run inside the timeout window and inside circuit accounting: every
//! attempt counts toward the failure ratio, and the deadline bounds all
//! attempts together. The first failing gate short-circuits to the fallback,
//! or to the caller when there is none.
//!
//! Lighter pipelines ([`protect_light`](AvailabilityOrchestrator::protect_light),
//! [`protect_standard`](AvailabilityOrchestrator::protect_standard)) skip the
//! gates a call-site does not need.

use rampart_core_resilience::{
    recover_with, FallbackStrategy, Gate, ResilienceError, ResilienceEvent,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::metrics::OUTCOME_SUCCESS;
use crate::runtime::AvailabilityRuntime;

type Outcome<T> = std::result::Result<T, ResilienceError>;

/// Substitute result for a call that was rejected or failed
pub type Fallback<T> = Arc<dyn Fn(&ResilienceError) -> Outcome<T> + Send + Sync>;

/// Wrap a closure as a [`Fallback`]
pub fn fallback<T, F>(f: F) -> Fallback<T>
where
    F: Fn(&ResilienceError) -> Outcome<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Runs operations through the gates of one runtime
///
/// Cheap to clone; clones share the runtime.
///
/// # Example
///
/// ```no_run
/// use rampart::{fallback, AvailabilityOrchestrator, AvailabilityRuntime};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn demo() -> rampart::Result<()> {
/// let runtime = Arc::new(AvailabilityRuntime::new()?);
/// runtime.configure_rate_limit("inventory", 100, Duration::from_secs(1))?;
///
/// let orchestrator = AvailabilityOrchestrator::new(runtime);
/// let stock = orchestrator
///     .protect(
///         "inventory",
///         || async { Ok(42u32) },
///         Some(fallback(|_| Ok(0u32))),
///     )
///     .await?;
/// assert_eq!(stock, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AvailabilityOrchestrator {
    runtime: Arc<AvailabilityRuntime>,
}

impl AvailabilityOrchestrator {
    pub fn new(runtime: Arc<AvailabilityRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<AvailabilityRuntime> {
        &self.runtime
    }

    /// Run `op` through every gate
    ///
    /// `op` may be invoked several times (once per retry attempt) and runs on
    /// a spawned task so the deadline can abandon it.
    pub async fn protect<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        fallback: Option<Fallback<T>>,
    ) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let started = Instant::now();
        let result = self.run_pipeline(resource, op, fallback.is_some()).await;
        self.observe(resource, &result, started);
        self.finish(resource, result, fallback)
    }

    async fn run_pipeline<T, F, Fut>(&self, resource: &str, op: F, has_fallback: bool) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let runtime = &self.runtime;

        runtime.rate_limiter().check(resource, 1).await?;
        runtime.circuit_breakers().check_admission(resource)?;

        if runtime.degradation().is_degraded(resource) {
            runtime.sink().record(&ResilienceEvent::Rejected {
                resource: resource.to_string(),
                gate: Gate::Degradation,
            });
            let degraded = ResilienceError::Degraded {
                resource: resource.to_string(),
            };
            if has_fallback {
                return Err(degraded);
            }
            return match runtime.degradation().degraded_impl::<T>(resource) {
                Some(degraded_impl) => {
                    tracing::debug!(resource = %resource, "running degraded implementation");
                    degraded_impl().await
                }
                None => Err(degraded),
            };
        }

        let op = Arc::new(op);
        let in_flight = Arc::new(AtomicBool::new(false));
        let guarded = {
            let runtime = Arc::clone(runtime);
            let in_flight = Arc::clone(&in_flight);
            let name = resource.to_string();
            move || async move {
                runtime
                    .retry()
                    .execute(&name, || {
                        let runtime = Arc::clone(&runtime);
                        let in_flight = Arc::clone(&in_flight);
                        let op = Arc::clone(&op);
                        let name = name.clone();
                        async move {
                            in_flight.store(true, Ordering::SeqCst);
                            let attempt = runtime.circuit_breakers().execute(&name, || op()).await;
                            in_flight.store(false, Ordering::SeqCst);
                            attempt
                        }
                    })
                    .await
            }
        };

        let result = runtime.timeout().execute(resource, guarded, None).await;

        // An attempt abandoned by the deadline or by a panic never reports its own outcome
        let abandoned = matches!(
            result,
            Err(ResilienceError::Timeout { .. }) | Err(ResilienceError::Panicked { .. })
        );
        if abandoned && in_flight.swap(false, Ordering::SeqCst) {
            runtime.circuit_breakers().record_failure(resource);
        }
        if let Ok(value) = &result {
            runtime.fallbacks().record_success(resource, value);
        }
        result
    }

    /// Circuit breaker and fallback only
    pub async fn protect_light<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        fallback: Option<Fallback<T>>,
    ) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let started = Instant::now();
        let result = self.runtime.circuit_breakers().execute(resource, op).await;
        if let Ok(value) = &result {
            self.runtime.fallbacks().record_success(resource, value);
        }
        self.observe(resource, &result, started);
        self.finish(resource, result, fallback)
    }

    /// Circuit breaker, retry and fallback
    ///
    /// Each attempt is admitted and recorded by the breaker separately.
    pub async fn protect_standard<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        fallback: Option<Fallback<T>>,
    ) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let started = Instant::now();
        let breakers = self.runtime.circuit_breakers();
        let result = self
            .runtime
            .retry()
            .execute(resource, || breakers.execute(resource, &op))
            .await;
        if let Ok(value) = &result {
            self.runtime.fallbacks().record_success(resource, value);
        }
        self.observe(resource, &result, started);
        self.finish(resource, result, fallback)
    }

    /// [`protect`](Self::protect) inside the resource's bulkhead
    ///
    /// The slot is held for the whole pipeline, retries included.
    pub async fn protect_isolated<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        fallback: Option<Fallback<T>>,
    ) -> Outcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let _permit = match self.runtime.bulkhead().acquire(resource, None).await {
            Ok(permit) => permit,
            Err(e) => return self.finish(resource, Err(e), fallback),
        };
        self.protect(resource, op, fallback).await
    }

    /// [`protect`](Self::protect), resolving failures with `strategy`
    ///
    /// `Ok(None)` means the strategy produced no value (`Empty`, or `Cached`
    /// before any success was recorded).
    pub async fn protect_with_strategy<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        strategy: FallbackStrategy,
    ) -> Outcome<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        match self.protect(resource, op, None).await {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                self.runtime
                    .fallbacks()
                    .resolve(resource, strategy, error, self.runtime.degradation())
                    .await
            }
        }
    }

    /// [`protect_with_strategy`](Self::protect_with_strategy) using the
    /// strategy configured for `resource`, or `Throw`
    pub async fn protect_configured<T, F, Fut>(&self, resource: &str, op: F) -> Outcome<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let strategy = self
            .runtime
            .fallbacks()
            .strategy(resource)
            .unwrap_or(FallbackStrategy::Throw);
        self.protect_with_strategy(resource, op, strategy).await
    }

    fn finish<T>(&self, resource: &str, result: Outcome<T>, fallback: Option<Fallback<T>>) -> Outcome<T> {
        match (result, fallback) {
            (Ok(value), _) => Ok(value),
            (Err(error), Some(fallback)) => {
                recover_with(resource, error, |e| fallback(e), self.runtime.sink())
            }
            (Err(error), None) => Err(error),
        }
    }

    fn observe<T>(&self, resource: &str, result: &Outcome<T>, started: Instant) {
        let outcome = match result {
            Ok(_) => OUTCOME_SUCCESS,
            Err(e) => e.kind().as_str(),
        };
        self.runtime
            .metrics()
            .observe_call(resource, outcome, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core_resilience::CircuitState;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn orchestrator() -> AvailabilityOrchestrator {
        AvailabilityOrchestrator::new(Arc::new(AvailabilityRuntime::new().unwrap()))
    }

    #[tokio::test]
    async fn test_protect_success_records_cache() {
        let orchestrator = orchestrator();
        let value = orchestrator
            .protect("db", || async { Ok(7u32) }, None)
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(orchestrator.runtime().fallbacks().cached::<u32>("db"), Some(7));
        assert_eq!(
            orchestrator.runtime().metrics().calls("db", OUTCOME_SUCCESS),
            1
        );
    }

    #[tokio::test]
    async fn test_rate_limit_short_circuits_to_fallback() {
        let orchestrator = orchestrator();
        orchestrator
            .runtime()
            .configure_rate_limit("api", 1, Duration::from_secs(60))
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let make_op = || {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("live")
                }
            }
        };

        let first = orchestrator.protect("api", make_op(), None).await;
        let second = orchestrator
            .protect("api", make_op(), Some(fallback(|_| Ok("fallback"))))
            .await;

        assert_eq!(first, Ok("live"));
        assert_eq!(second, Ok("fallback"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_before_op() {
        let orchestrator = orchestrator();
        orchestrator.runtime().circuit_breakers().force_open("db");

        let result = orchestrator
            .protect("db", || async { Ok(1u8) }, None)
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::CircuitOpen {
                state: CircuitState::Open,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_degraded_without_fallback_uses_registered_impl() {
        let orchestrator = orchestrator();
        let runtime = orchestrator.runtime();
        runtime.degradation().mark_degraded("search");

        let missing = orchestrator
            .protect("search", || async { Ok(vec![1u8]) }, None)
            .await;
        assert_eq!(
            missing,
            Err(ResilienceError::Degraded {
                resource: "search".to_string()
            })
        );

        runtime
            .degradation()
            .register_degraded_impl("search", || async { Ok(Vec::<u8>::new()) });
        let degraded = orchestrator
            .protect("search", || async { Ok(vec![1u8]) }, None)
            .await;
        assert_eq!(degraded, Ok(Vec::new()));

        let with_fallback = orchestrator
            .protect("search", || async { Ok(vec![1u8]) }, Some(fallback(|_| Ok(vec![9u8]))))
            .await;
        assert_eq!(with_fallback, Ok(vec![9u8]));
        assert_eq!(
            runtime.metrics().rejections("search", Gate::Degradation),
            3
        );
    }

    #[tokio::test]
    async fn test_protect_light_and_standard() {
        let orchestrator = orchestrator();
        orchestrator
            .runtime()
            .configure_retry("flaky", 2, Duration::from_millis(1), Default::default())
            .unwrap();

        let light = orchestrator
            .protect_light(
                "flaky",
                || async { Err::<u8, _>(ResilienceError::Transient("down".to_string())) },
                Some(fallback(|_| Ok(0u8))),
            )
            .await;
        assert_eq!(light, Ok(0));

        let attempts = AtomicU32::new(0);
        let standard = orchestrator
            .protect_standard(
                "flaky",
                || async {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::Transient("down".to_string()))
                    } else {
                        Ok(5u8)
                    }
                },
                None,
            )
            .await;
        assert_eq!(standard, Ok(5));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let stats = orchestrator.runtime().circuit_breakers().stats("flaky").unwrap();
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.total_successes, 1);
    }
}
