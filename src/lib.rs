/*!
 * Rampart - availability kernel for protected calls
 *
 * Wraps calls to databases, caches and remote services with:
 * - Fixed-window rate limiting (in-process or shared through a counter store)
 * - Per-resource circuit breakers
 * - Bulkhead concurrency isolation
 * - Retry with fixed, linear or exponential backoff
 * - Deadlines that bound every retry attempt together
 * - Fallbacks and degraded mode
 * - Prometheus metrics and structured logging
 *
 * Version: 0.1.0
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod runtime;

// Re-export commonly used types
pub use config::{KernelConfig, LogLevel, LoggingConfig, ResourceConfig};
pub use error::{RampartError, Result};
pub use logging::init_logging;
pub use metrics::KernelMetrics;
pub use orchestrator::{fallback, AvailabilityOrchestrator, Fallback};
pub use runtime::{AvailabilityRuntime, ResourceSnapshot};

pub use rampart_core_resilience::{
    BackoffStrategy, BulkheadRule, CircuitBreakerRule, CircuitState, CounterStore, ErrorKind,
    FallbackStrategy, InMemoryCounterStore, RateLimitRule, RateLimiter, ResilienceError,
    RetryPolicy,
};

#[cfg(feature = "governor-impl")]
pub use rampart_core_resilience::GovernorRateLimiter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
