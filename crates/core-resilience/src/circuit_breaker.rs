//! Circuit breaker registry for fault tolerance
//!
//! One breaker per resource name, created lazily on first use. Each breaker
//! is a three-state machine:
//! - Closed: requests pass; outcomes are counted and the failure ratio is
//!   evaluated once `request_volume_threshold` calls have been seen
//! - Open: requests fail immediately until `open_duration` has elapsed
//! - HalfOpen: requests are admitted as probes; `half_open_success_threshold`
//!   successes close the circuit, a single failure reopens it
//!
//! ```text
//! Closed ──ratio tripped──▶ Open ──open_duration elapsed──▶ HalfOpen
//!    ▲                        ▲                                │
//!    │                        └───────── any failure ──────────┤
//!    └────────────── success threshold reached ────────────────┘
//! ```
//!
//! Every check-and-transition happens inside a single per-resource critical
//! section, so concurrent callers observing an expired Open state perform
//! the Open → HalfOpen transition exactly once.

use crate::error::ResilienceError;
use crate::events::{EventSink, Gate, ResilienceEvent, TracingSink};
use crate::fallback::recover_with;
use crate::sync::{lock, read, write};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tripping and recovery policy for one resource
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerRule {
    /// Failure ratio (failures / total) at or above which the circuit opens
    pub failure_ratio: f64,
    /// Minimum number of recorded outcomes before the ratio is evaluated
    pub request_volume_threshold: u32,
    /// Time spent Open before a probe is admitted
    pub open_duration: Duration,
    /// Successes required in HalfOpen to close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerRule {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            request_volume_threshold: 20,
            open_duration: Duration::from_secs(5),
            half_open_success_threshold: 1,
        }
    }
}

impl CircuitBreakerRule {
    pub fn new(
        failure_ratio: f64,
        request_volume_threshold: u32,
        open_duration: Duration,
        half_open_success_threshold: u32,
    ) -> Self {
        Self {
            failure_ratio,
            request_volume_threshold,
            open_duration,
            half_open_success_threshold,
        }
    }

    /// Reject rules the state machine cannot honour
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(0.0..=1.0).contains(&self.failure_ratio) || self.failure_ratio.is_nan() {
            return Err(ResilienceError::Config(format!(
                "failure_ratio must be within [0, 1], got {}",
                self.failure_ratio
            )));
        }
        if self.request_volume_threshold == 0 {
            return Err(ResilienceError::Config(
                "request_volume_threshold must be > 0".to_string(),
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ResilienceError::Config(
                "half_open_success_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStats {
    pub resource: String,
    pub state: CircuitState,
    /// Successes since the last transition, saturating at `u32::MAX`
    pub success_count: u32,
    /// Failures since the last transition
    pub failure_count: u32,
    /// Rejections since the last transition
    pub rejected_count: u32,
    pub time_in_state: Duration,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub transitions: u64,
}

/// Mutable state of one breaker
#[derive(Debug)]
struct CircuitContext {
    rule: CircuitBreakerRule,
    state: CircuitState,
    success_count: u32,
    failure_count: u32,
    rejected_count: u32,
    state_entered_at: Instant,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    transitions: u64,
}

impl CircuitContext {
    fn new(rule: CircuitBreakerRule) -> Self {
        Self {
            rule,
            state: CircuitState::Closed,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            state_entered_at: Instant::now(),
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            transitions: 0,
        }
    }

    /// Move to `to`, resetting the per-state counters
    fn transition(&mut self, resource: &str, to: CircuitState, forced: bool) -> ResilienceEvent {
        let from = self.state;
        self.state = to;
        self.success_count = 0;
        self.failure_count = 0;
        self.rejected_count = 0;
        self.state_entered_at = Instant::now();
        self.transitions = self.transitions.saturating_add(1);

        ResilienceEvent::StateTransition {
            resource: resource.to_string(),
            from,
            to,
            forced,
        }
    }

    fn remaining_open(&self) -> Duration {
        self.rule
            .open_duration
            .saturating_sub(self.state_entered_at.elapsed())
    }

    fn ratio_tripped(&self) -> bool {
        let total = self.success_count.saturating_add(self.failure_count);
        if total < self.rule.request_volume_threshold {
            return false;
        }
        (self.failure_count as f64 / total as f64) >= self.rule.failure_ratio
    }
}

/// Per-resource circuit breakers
///
/// Cloning is cheap; clones share the same breakers.
///
/// # Example
/// ```no_run
/// use rampart_core_resilience::{CircuitBreakerRegistry, CircuitBreakerRule, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breakers = CircuitBreakerRegistry::new(CircuitBreakerRule::default());
///
///     let result = breakers
///         .execute("inventory-db", || async { Ok::<_, ResilienceError>(42) })
///         .await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    default_rule: Arc<RwLock<CircuitBreakerRule>>,
    circuits: Arc<RwLock<HashMap<String, Arc<Mutex<CircuitContext>>>>>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_rule", &*read(&self.default_rule))
            .field("circuits", &read(&self.circuits).len())
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerRule::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry whose lazily created breakers start from `default_rule`
    pub fn new(default_rule: CircuitBreakerRule) -> Self {
        Self {
            default_rule: Arc::new(RwLock::new(default_rule)),
            circuits: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(TracingSink),
        }
    }

    /// Route events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the rule used for breakers created from now on
    pub fn set_default_rule(&self, rule: CircuitBreakerRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        *write(&self.default_rule) = rule;
        Ok(())
    }

    /// Set the rule for one resource
    ///
    /// Current state and counters are kept, so applying the same rule twice
    /// is a no-op.
    pub fn configure(&self, resource: &str, rule: CircuitBreakerRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        let ctx = self.context(resource);
        lock(&ctx).rule = rule;
        Ok(())
    }

    /// Rule currently governing `resource`
    pub fn rule(&self, resource: &str) -> CircuitBreakerRule {
        match read(&self.circuits).get(resource) {
            Some(ctx) => lock(ctx).rule.clone(),
            None => read(&self.default_rule).clone(),
        }
    }

    fn context(&self, resource: &str) -> Arc<Mutex<CircuitContext>> {
        if let Some(ctx) = read(&self.circuits).get(resource) {
            return Arc::clone(ctx);
        }
        let rule = read(&self.default_rule).clone();
        let mut circuits = write(&self.circuits);
        Arc::clone(
            circuits
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitContext::new(rule)))),
        )
    }

    fn emit(&self, event: Option<ResilienceEvent>) {
        if let Some(event) = event {
            self.sink.record(&event);
        }
    }

    /// Admission check; performs the Open → HalfOpen transition when due
    pub fn is_request_allowed(&self, resource: &str) -> bool {
        self.check_admission(resource).is_ok()
    }

    /// Admission check returning the rejection as a typed error
    pub fn check_admission(&self, resource: &str) -> Result<(), ResilienceError> {
        let ctx = self.context(resource);
        let (result, event) = {
            let mut ctx = lock(&ctx);
            match ctx.state {
                CircuitState::Closed | CircuitState::HalfOpen => (Ok(()), None),
                CircuitState::Open => {
                    if ctx.state_entered_at.elapsed() >= ctx.rule.open_duration {
                        let event = ctx.transition(resource, CircuitState::HalfOpen, false);
                        (Ok(()), Some(event))
                    } else {
                        ctx.rejected_count = ctx.rejected_count.saturating_add(1);
                        ctx.total_rejections = ctx.total_rejections.saturating_add(1);
                        let err = ResilienceError::CircuitOpen {
                            resource: resource.to_string(),
                            state: CircuitState::Open,
                            remaining: Some(ctx.remaining_open()),
                        };
                        let event = ResilienceEvent::Rejected {
                            resource: resource.to_string(),
                            gate: Gate::CircuitBreaker,
                        };
                        (Err(err), Some(event))
                    }
                }
            }
        };
        self.emit(event);
        result
    }

    /// Record a successful outcome
    pub fn record_success(&self, resource: &str) {
        let ctx = self.context(resource);
        let event = {
            let mut ctx = lock(&ctx);
            match ctx.state {
                CircuitState::Closed => {
                    ctx.success_count = ctx.success_count.saturating_add(1);
                    ctx.total_successes = ctx.total_successes.saturating_add(1);
                    if ctx.ratio_tripped() {
                        Some(ctx.transition(resource, CircuitState::Open, false))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    ctx.success_count = ctx.success_count.saturating_add(1);
                    ctx.total_successes = ctx.total_successes.saturating_add(1);
                    if ctx.success_count >= ctx.rule.half_open_success_threshold {
                        Some(ctx.transition(resource, CircuitState::Closed, false))
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    // Late result from a call admitted before the circuit opened
                    ctx.total_successes = ctx.total_successes.saturating_add(1);
                    None
                }
            }
        };
        self.emit(event);
    }

    /// Record a failed outcome
    pub fn record_failure(&self, resource: &str) {
        let ctx = self.context(resource);
        let event = {
            let mut ctx = lock(&ctx);
            ctx.total_failures = ctx.total_failures.saturating_add(1);
            match ctx.state {
                CircuitState::Closed => {
                    ctx.failure_count = ctx.failure_count.saturating_add(1);
                    if ctx.ratio_tripped() {
                        Some(ctx.transition(resource, CircuitState::Open, false))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(ctx.transition(resource, CircuitState::Open, false)),
                CircuitState::Open => None,
            }
        };
        self.emit(event);
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// The outcome is recorded; errors that are not the operation's fault
    /// (see [`ResilienceError::should_trip_breaker`]) are not counted.
    pub async fn execute<F, Fut, T>(&self, resource: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.check_admission(resource)?;

        match op().await {
            Ok(result) => {
                self.record_success(resource);
                Ok(result)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.record_failure(resource);
                }
                Err(e)
            }
        }
    }

    /// Like [`execute`](Self::execute), substituting `fallback` on rejection or failure
    ///
    /// The failure is recorded before the fallback runs, so a fallback never
    /// hides an error from the breaker's counters.
    pub async fn execute_with_fallback<F, Fut, T, FB>(
        &self,
        resource: &str,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        FB: FnOnce(&ResilienceError) -> Result<T, ResilienceError>,
    {
        match self.execute(resource, op).await {
            Ok(result) => Ok(result),
            Err(e) => recover_with(resource, e, fallback, self.sink.as_ref()),
        }
    }

    /// Current state; unknown resources report Closed
    pub fn state(&self, resource: &str) -> CircuitState {
        match read(&self.circuits).get(resource) {
            Some(ctx) => lock(ctx).state,
            None => CircuitState::Closed,
        }
    }

    /// Operator override: open immediately
    pub fn force_open(&self, resource: &str) {
        self.force(resource, CircuitState::Open);
    }

    /// Operator override: close immediately
    pub fn force_close(&self, resource: &str) {
        self.force(resource, CircuitState::Closed);
    }

    /// Operator override: enter half-open immediately
    pub fn force_half_open(&self, resource: &str) {
        self.force(resource, CircuitState::HalfOpen);
    }

    fn force(&self, resource: &str, to: CircuitState) {
        let ctx = self.context(resource);
        let event = lock(&ctx).transition(resource, to, true);
        self.emit(Some(event));
    }

    /// Reset the breaker to closed state with all counters cleared
    pub fn reset(&self, resource: &str) {
        if let Some(ctx) = read(&self.circuits).get(resource) {
            let rule = lock(ctx).rule.clone();
            *lock(ctx) = CircuitContext::new(rule);
        }
    }

    /// Reset every known breaker
    pub fn reset_all(&self) {
        for ctx in read(&self.circuits).values() {
            let rule = lock(ctx).rule.clone();
            *lock(ctx) = CircuitContext::new(rule);
        }
    }

    /// Statistics for one breaker, if it has been used
    pub fn stats(&self, resource: &str) -> Option<CircuitStats> {
        let circuits = read(&self.circuits);
        let ctx = lock(circuits.get(resource)?);
        Some(CircuitStats {
            resource: resource.to_string(),
            state: ctx.state,
            success_count: ctx.success_count,
            failure_count: ctx.failure_count,
            rejected_count: ctx.rejected_count,
            time_in_state: ctx.state_entered_at.elapsed(),
            total_successes: ctx.total_successes,
            total_failures: ctx.total_failures,
            total_rejections: ctx.total_rejections,
            transitions: ctx.transitions,
        })
    }

    /// State of every known breaker, sorted by resource name
    pub fn all_states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = read(&self.circuits)
            .iter()
            .map(|(name, ctx)| (name.clone(), lock(ctx).state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Resources whose circuit is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        self.all_states()
            .into_iter()
            .filter(|(_, state)| *state == CircuitState::Open)
            .map(|(name, _)| name)
            .collect()
    }

    /// Resource names with a breaker
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.circuits).keys().cloned().collect();
        names.sort();
        names
    }
}
