//! Rampart Core Resilience: Pure-logic availability primitives
//!
//! # Overview
//!
//! This crate provides the gates a call passes through before it reaches a
//! dependency, all keyed by a resource name:
//!
//! - **Rate Limiter**: Fixed-window quotas, in-process or shared through a counter store
//! - **Circuit Breaker**: Ratio-based failure detection with timed recovery probes
//! - **Bulkhead**: Per-resource concurrency slots with a bounded wait queue
//! - **Retry**: Fixed, linear or exponential backoff with jitter and error filters
//! - **Timeout**: Per-resource deadlines that abort the abandoned work
//! - **Fallback**: Substitute values, cached last results and redirects
//! - **Degradation**: Operator switch for running reduced implementations
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - What the protected operation does
//! - Where configuration comes from
//! - How metrics are exported (see [`EventSink`])
//!
//! Unknown resources get the component's default rule, except for rate
//! limiting where an unconfigured resource is not limited.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Reject over quota
//! │  (Fixed window, local or shared)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail fast
//! │  (Closed → Open → HalfOpen → Closed)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Degradation Switch                │  ← Reduced mode
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Timeout ( Retry ( Operation ) )   │  ← Bounded attempts
//! └─────────────┬───────────────────────────┘
//!               │
//!          On failure:
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fallback                          │  ← Substitute result
//! │  (Default, cached, degraded, redirect)  │
//! └─────────────────────────────────────────┘
//!
//!  Optional around the whole pipeline:
//!   Bulkhead → per-resource concurrency isolation
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```no_run
//! use rampart_core_resilience::{CircuitBreakerRegistry, CircuitBreakerRule, ResilienceError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breakers = CircuitBreakerRegistry::new(CircuitBreakerRule::default());
//! breakers.configure(
//!     "payments",
//!     CircuitBreakerRule::new(0.5, 10, Duration::from_secs(30), 2),
//! )?;
//!
//! let result = breakers
//!     .execute("payments", || async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry with Backoff
//!
//! ```no_run
//! use rampart_core_resilience::{BackoffStrategy, ResilienceError, RetryExecutor};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let retry = RetryExecutor::default();
//! retry.configure_simple("search", 3, Duration::from_millis(50), BackoffStrategy::Exponential)?;
//!
//! let hits = retry
//!     .execute("search", || async { Ok::<_, ResilienceError>(vec!["a", "b"]) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod counter_store;
pub mod degradation;
pub mod error;
pub mod events;
pub mod fallback;
pub mod rate_limiter;
pub mod retry;
pub mod shared_rate_limiter;
mod sync;
pub mod timeout;

// Re-export main types for convenience
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRule, BulkheadStats};
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerRule, CircuitState, CircuitStats};
pub use counter_store::{CounterStore, InMemoryCounterStore};
pub use degradation::{DegradationSwitch, DegradedFn};
pub use error::{ErrorKind, ResilienceError};
pub use events::{EventSink, Gate, NoopSink, ResilienceEvent, TracingSink};
pub use fallback::{recover_with, FallbackFn, FallbackRegistry, FallbackStrategy, RedirectFn};
pub use rate_limiter::{LocalRateLimiter, RateLimitRule, RateLimiter};
pub use retry::{BackoffStrategy, RetryExecutor, RetryPolicy};
pub use shared_rate_limiter::SharedRateLimiter;
pub use timeout::TimeoutExecutor;

#[cfg(feature = "governor-impl")]
pub use rate_limiter::governor_impl::GovernorRateLimiter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use rampart_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::bulkhead::{Bulkhead, BulkheadRule};
    pub use super::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerRule, CircuitState};
    pub use super::degradation::DegradationSwitch;
    pub use super::error::{ErrorKind, ResilienceError};
    pub use super::events::{EventSink, ResilienceEvent};
    pub use super::fallback::{FallbackRegistry, FallbackStrategy};
    pub use super::rate_limiter::{LocalRateLimiter, RateLimitRule, RateLimiter};
    pub use super::retry::{BackoffStrategy, RetryExecutor, RetryPolicy};
    pub use super::timeout::TimeoutExecutor;
}
