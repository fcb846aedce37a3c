//! Prometheus metrics derived from kernel events
//!
//! [`KernelMetrics`] is an [`EventSink`]: every component of a runtime
//! reports through it, and it forwards each event to [`TracingSink`] as
//! well. Each runtime owns its own registry, so several runtimes (or tests)
//! in one process never collide.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use rampart_core_resilience::{EventSink, Gate, ResilienceEvent, TracingSink};
use std::time::Duration;

use crate::error::{RampartError, Result};

/// Outcome label for protected calls that returned a value
pub const OUTCOME_SUCCESS: &str = "success";

/// Metric families for one runtime
#[derive(Clone)]
pub struct KernelMetrics {
    registry: Registry,
    rejections: IntCounterVec,
    circuit_transitions: IntCounterVec,
    retries: IntCounterVec,
    timeouts: IntCounterVec,
    fallbacks: IntCounterVec,
    bulkhead_admitted: IntCounterVec,
    call_seconds: HistogramVec,
    tracing: TracingSink,
}

impl std::fmt::Debug for KernelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelMetrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl KernelMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rejections = counter(
            &registry,
            "rampart_rejections_total",
            "Calls rejected by an admission gate",
            &["resource", "gate"],
        )?;
        let circuit_transitions = counter(
            &registry,
            "rampart_circuit_transitions_total",
            "Circuit breaker state transitions",
            &["resource", "from", "to"],
        )?;
        let retries = counter(
            &registry,
            "rampart_retries_total",
            "Retry attempts scheduled",
            &["resource"],
        )?;
        let timeouts = counter(
            &registry,
            "rampart_timeouts_total",
            "Protected calls that exceeded their deadline",
            &["resource"],
        )?;
        let fallbacks = counter(
            &registry,
            "rampart_fallbacks_total",
            "Fallback invocations by outcome",
            &["resource", "outcome"],
        )?;
        let bulkhead_admitted = counter(
            &registry,
            "rampart_bulkhead_admitted_total",
            "Calls admitted into a bulkhead compartment",
            &["resource"],
        )?;

        let call_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rampart_protected_call_seconds",
                "Latency of protected calls, gates included",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["resource", "outcome"],
        )?;
        registry.register(Box::new(call_seconds.clone()))?;

        Ok(Self {
            registry,
            rejections,
            circuit_transitions,
            retries,
            timeouts,
            fallbacks,
            bulkhead_admitted,
            call_seconds,
            tracing: TracingSink,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the latency of one protected call
    pub fn observe_call(&self, resource: &str, outcome: &str, elapsed: Duration) {
        self.call_seconds
            .with_label_values(&[resource, outcome])
            .observe(elapsed.as_secs_f64());
    }

    /// Rejections of `resource` by `gate` so far
    pub fn rejections(&self, resource: &str, gate: Gate) -> u64 {
        self.rejections
            .with_label_values(&[resource, gate.as_str()])
            .get()
    }

    /// Retries scheduled for `resource` so far
    pub fn retries(&self, resource: &str) -> u64 {
        self.retries.with_label_values(&[resource]).get()
    }

    /// Timeouts of `resource` so far
    pub fn timeouts(&self, resource: &str) -> u64 {
        self.timeouts.with_label_values(&[resource]).get()
    }

    /// Fallbacks for `resource` with `outcome` ("invoked" or "failed")
    pub fn fallbacks(&self, resource: &str, outcome: &str) -> u64 {
        self.fallbacks.with_label_values(&[resource, outcome]).get()
    }

    /// Calls observed for `resource` with `outcome`
    pub fn calls(&self, resource: &str, outcome: &str) -> u64 {
        self.call_seconds
            .with_label_values(&[resource, outcome])
            .get_sample_count()
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| RampartError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

impl EventSink for KernelMetrics {
    fn record(&self, event: &ResilienceEvent) {
        self.tracing.record(event);

        match event {
            ResilienceEvent::Rejected { resource, gate } => {
                self.rejections
                    .with_label_values(&[resource.as_str(), gate.as_str()])
                    .inc();
            }
            ResilienceEvent::StateTransition {
                resource, from, to, ..
            } => {
                self.circuit_transitions
                    .with_label_values(&[resource.as_str(), from.as_str(), to.as_str()])
                    .inc();
            }
            ResilienceEvent::RetryScheduled { resource, .. } => {
                self.retries.with_label_values(&[resource.as_str()]).inc();
            }
            ResilienceEvent::TimedOut { resource, .. } => {
                self.timeouts.with_label_values(&[resource.as_str()]).inc();
            }
            ResilienceEvent::FallbackInvoked { resource } => {
                self.fallbacks
                    .with_label_values(&[resource.as_str(), "invoked"])
                    .inc();
            }
            ResilienceEvent::FallbackFailed { resource, .. } => {
                self.fallbacks
                    .with_label_values(&[resource.as_str(), "failed"])
                    .inc();
            }
            ResilienceEvent::BulkheadAdmitted { resource, .. } => {
                self.bulkhead_admitted
                    .with_label_values(&[resource.as_str()])
                    .inc();
            }
            ResilienceEvent::RetriesExhausted { .. } => {}
        }
    }
}
