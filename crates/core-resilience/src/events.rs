//! Event sink: where gates report what they did
//!
//! The primitives never talk to a metrics backend directly. Each notable
//! decision (rejection, state transition, retry, timeout, fallback) is
//! described as a [`ResilienceEvent`] and handed to an [`EventSink`]. The
//! embedding application decides whether that becomes a log line, a
//! Prometheus counter, or nothing at all.

use crate::circuit_breaker::CircuitState;
use std::time::Duration;

/// Which gate rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    RateLimiter,
    CircuitBreaker,
    Bulkhead,
    Degradation,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::RateLimiter => "rate_limiter",
            Gate::CircuitBreaker => "circuit_breaker",
            Gate::Bulkhead => "bulkhead",
            Gate::Degradation => "degradation",
        }
    }
}

/// A single observable decision taken by one of the gates
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A gate refused admission
    Rejected { resource: String, gate: Gate },

    /// The circuit breaker moved between states
    StateTransition {
        resource: String,
        from: CircuitState,
        to: CircuitState,
        forced: bool,
    },

    /// A failed attempt will be retried after `delay`
    RetryScheduled {
        resource: String,
        attempt: u32,
        delay: Duration,
    },

    /// All retries were spent and the final error is being returned
    RetriesExhausted { resource: String, attempts: u32 },

    /// The timeout executor gave up waiting
    TimedOut {
        resource: String,
        timeout: Duration,
        elapsed: Duration,
    },

    /// A bulkhead slot was granted
    BulkheadAdmitted { resource: String, waited: Duration },

    /// A fallback produced the result returned to the caller
    FallbackInvoked { resource: String },

    /// A fallback failed; the original error propagates
    FallbackFailed { resource: String, error: String },
}

impl ResilienceEvent {
    pub fn resource(&self) -> &str {
        match self {
            ResilienceEvent::Rejected { resource, .. }
            | ResilienceEvent::StateTransition { resource, .. }
            | ResilienceEvent::RetryScheduled { resource, .. }
            | ResilienceEvent::RetriesExhausted { resource, .. }
            | ResilienceEvent::TimedOut { resource, .. }
            | ResilienceEvent::BulkheadAdmitted { resource, .. }
            | ResilienceEvent::FallbackInvoked { resource }
            | ResilienceEvent::FallbackFailed { resource, .. } => resource,
        }
    }
}

/// Receiver of [`ResilienceEvent`]s
///
/// Called synchronously on the caller's task; implementations must be cheap
/// and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &ResilienceEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &ResilienceEvent) {}
}

/// Writes every event as a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::Rejected { resource, gate } => {
                tracing::warn!(resource = %resource, gate = gate.as_str(), "call rejected");
            }
            ResilienceEvent::StateTransition {
                resource,
                from,
                to,
                forced,
            } => {
                tracing::info!(
                    resource = %resource,
                    from = %from,
                    to = %to,
                    forced = *forced,
                    "circuit state transition"
                );
            }
            ResilienceEvent::RetryScheduled {
                resource,
                attempt,
                delay,
            } => {
                tracing::debug!(resource = %resource, attempt = *attempt, delay = ?delay, "retry scheduled");
            }
            ResilienceEvent::RetriesExhausted { resource, attempts } => {
                tracing::warn!(resource = %resource, attempts = *attempts, "retries exhausted");
            }
            ResilienceEvent::TimedOut {
                resource,
                timeout,
                elapsed,
            } => {
                tracing::warn!(resource = %resource, timeout = ?timeout, elapsed = ?elapsed, "operation timed out");
            }
            ResilienceEvent::BulkheadAdmitted { resource, waited } => {
                tracing::debug!(resource = %resource, waited = ?waited, "bulkhead slot granted");
            }
            ResilienceEvent::FallbackInvoked { resource } => {
                tracing::debug!(resource = %resource, "fallback invoked");
            }
            ResilienceEvent::FallbackFailed { resource, error } => {
                tracing::warn!(resource = %resource, error = %error, "fallback failed, propagating original error");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects events for assertions
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<ResilienceEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<ResilienceEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn record(&self, event: &ResilienceEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
