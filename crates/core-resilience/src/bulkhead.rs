//! Bulkhead: per-resource concurrency isolation
//!
//! Each resource gets its own compartment with a fixed number of concurrent
//! slots and a bounded wait queue. A flood of calls to one resource cannot
//! take slots from another.
//!
//! Slots are handed out in FIFO order ([`tokio::sync::Semaphore`] is fair).
//! A [`BulkheadPermit`] returns its slot when dropped, so a slot is released
//! on every exit path including panics and cancellation.
//!
//! # Example
//!
//! ```no_run
//! use rampart_core_resilience::{Bulkhead, BulkheadRule, ResilienceError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError> {
//!     let bulkhead = Bulkhead::default();
//!     bulkhead.configure("db", BulkheadRule::new(10, 50, Duration::from_millis(200)))?;
//!
//!     let rows = bulkhead
//!         .execute("db", || async { Ok::<_, ResilienceError>(vec![1, 2, 3]) }, None)
//!         .await?;
//!     assert_eq!(rows.len(), 3);
//!     Ok(())
//! }
//! ```

use crate::error::ResilienceError;
use crate::events::{EventSink, Gate, ResilienceEvent, TracingSink};
use crate::sync::{read, write};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Limits for one compartment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRule {
    /// Calls allowed to run at once
    pub max_concurrent: usize,
    /// Calls allowed to wait for a slot
    pub queue_capacity: usize,
    /// How long a queued call waits before giving up; zero means never wait
    pub wait_timeout: Duration,
}

impl Default for BulkheadRule {
    fn default() -> Self {
        Self {
            max_concurrent: 25,
            queue_capacity: 100,
            wait_timeout: Duration::from_secs(1),
        }
    }
}

impl BulkheadRule {
    pub fn new(max_concurrent: usize, queue_capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            max_concurrent,
            queue_capacity,
            wait_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent == 0 {
            return Err(ResilienceError::Config(
                "max_concurrent must be > 0".to_string(),
            ));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::Config(format!(
                "max_concurrent must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of one compartment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadStats {
    pub resource: String,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub active: usize,
    pub available: usize,
    pub waiting: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct Compartment {
    rule: BulkheadRule,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl Compartment {
    fn new(rule: BulkheadRule) -> Self {
        Self {
            rule,
            semaphore: Arc::new(Semaphore::new(rule.max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }
}

/// Decrements the waiting count when a queued acquire ends, however it ends
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An occupied bulkhead slot
///
/// The slot is returned when the permit is dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    resource: String,
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Return the slot now
    pub fn release(self) {}
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-resource concurrency limits
#[derive(Clone)]
pub struct Bulkhead {
    default_rule: Arc<RwLock<BulkheadRule>>,
    compartments: Arc<RwLock<HashMap<String, Arc<Compartment>>>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("default_rule", &*read(&self.default_rule))
            .field("compartments", &read(&self.compartments).len())
            .finish()
    }
}

impl Default for Bulkhead {
    fn default() -> Self {
        Self::new(BulkheadRule::default())
    }
}

impl Bulkhead {
    /// Create a bulkhead applying `default_rule` to unconfigured resources
    pub fn new(default_rule: BulkheadRule) -> Self {
        Self {
            default_rule: Arc::new(RwLock::new(default_rule)),
            compartments: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Abort queued acquires when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_default_rule(&self, rule: BulkheadRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        *write(&self.default_rule) = rule;
        Ok(())
    }

    /// Set the limits for `resource`
    ///
    /// Re-applying the current rule is a no-op. A different rule replaces the
    /// compartment; calls holding slots in the old one keep them until done.
    pub fn configure(&self, resource: &str, rule: BulkheadRule) -> Result<(), ResilienceError> {
        rule.validate()?;
        let mut compartments = write(&self.compartments);
        if compartments.get(resource).is_some_and(|c| c.rule == rule) {
            return Ok(());
        }
        compartments.insert(resource.to_string(), Arc::new(Compartment::new(rule)));
        tracing::debug!(
            resource = %resource,
            max_concurrent = rule.max_concurrent,
            queue_capacity = rule.queue_capacity,
            "bulkhead configured"
        );
        Ok(())
    }

    /// Limits in force for `resource`
    pub fn rule(&self, resource: &str) -> BulkheadRule {
        read(&self.compartments)
            .get(resource)
            .map(|c| c.rule)
            .unwrap_or_else(|| *read(&self.default_rule))
    }

    fn compartment(&self, resource: &str) -> Arc<Compartment> {
        if let Some(c) = read(&self.compartments).get(resource) {
            return Arc::clone(c);
        }
        let default_rule = *read(&self.default_rule);
        let mut compartments = write(&self.compartments);
        Arc::clone(
            compartments
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Compartment::new(default_rule))),
        )
    }

    fn admit(
        &self,
        resource: &str,
        compartment: &Compartment,
        permit: OwnedSemaphorePermit,
        waited: Duration,
    ) -> BulkheadPermit {
        compartment.active.fetch_add(1, Ordering::SeqCst);
        compartment.total_admitted.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&ResilienceEvent::BulkheadAdmitted {
            resource: resource.to_string(),
            waited,
        });
        BulkheadPermit {
            resource: resource.to_string(),
            active: Arc::clone(&compartment.active),
            _permit: permit,
        }
    }

    fn reject(&self, resource: &str, compartment: &Compartment) -> ResilienceError {
        compartment.total_rejected.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&ResilienceEvent::Rejected {
            resource: resource.to_string(),
            gate: Gate::Bulkhead,
        });
        ResilienceError::BulkheadFull {
            resource: resource.to_string(),
            max_concurrent: compartment.rule.max_concurrent,
            queue_capacity: compartment.rule.queue_capacity,
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self, resource: &str) -> Result<BulkheadPermit, ResilienceError> {
        let compartment = self.compartment(resource);
        match Arc::clone(&compartment.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.admit(resource, &compartment, permit, Duration::ZERO)),
            Err(_) => Err(self.reject(resource, &compartment)),
        }
    }

    /// Take a slot, queueing for up to `wait_timeout`
    ///
    /// `None` uses the compartment's configured wait. Fails fast with
    /// [`ResilienceError::BulkheadFull`] if the queue is already full.
    pub async fn acquire(
        &self,
        resource: &str,
        wait_timeout: Option<Duration>,
    ) -> Result<BulkheadPermit, ResilienceError> {
        let compartment = self.compartment(resource);
        let wait_timeout = wait_timeout.unwrap_or(compartment.rule.wait_timeout);

        if let Ok(permit) = Arc::clone(&compartment.semaphore).try_acquire_owned() {
            return Ok(self.admit(resource, &compartment, permit, Duration::ZERO));
        }
        if wait_timeout.is_zero() {
            return Err(self.reject(resource, &compartment));
        }

        let queued = compartment.waiting.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot(&compartment.waiting);
        if queued >= compartment.rule.queue_capacity {
            drop(slot);
            return Err(self.reject(resource, &compartment));
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            acquired = tokio::time::timeout(
                wait_timeout,
                Arc::clone(&compartment.semaphore).acquire_owned(),
            ) => Some(acquired),
        };
        drop(slot);

        match outcome {
            None => Err(ResilienceError::Cancelled {
                resource: resource.to_string(),
            }),
            Some(Ok(Ok(permit))) => Ok(self.admit(resource, &compartment, permit, started.elapsed())),
            Some(Ok(Err(_))) | Some(Err(_)) => Err(self.reject(resource, &compartment)),
        }
    }

    /// Run `op` inside the compartment for `resource`
    pub async fn execute<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        wait_timeout: Option<Duration>,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let _permit = self.acquire(resource, wait_timeout).await?;
        op().await
    }

    /// Calls currently holding a slot
    pub fn active_count(&self, resource: &str) -> usize {
        read(&self.compartments)
            .get(resource)
            .map(|c| c.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Free slots
    pub fn available_slots(&self, resource: &str) -> usize {
        match read(&self.compartments).get(resource) {
            Some(c) => c.semaphore.available_permits(),
            None => read(&self.default_rule).max_concurrent,
        }
    }

    /// Calls queued for a slot
    pub fn waiting_count(&self, resource: &str) -> usize {
        read(&self.compartments)
            .get(resource)
            .map(|c| c.waiting.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn stats(&self, resource: &str) -> Option<BulkheadStats> {
        let compartments = read(&self.compartments);
        let c = compartments.get(resource)?;
        Some(BulkheadStats {
            resource: resource.to_string(),
            max_concurrent: c.rule.max_concurrent,
            queue_capacity: c.rule.queue_capacity,
            active: c.active.load(Ordering::SeqCst),
            available: c.semaphore.available_permits(),
            waiting: c.waiting.load(Ordering::SeqCst),
            total_admitted: c.total_admitted.load(Ordering::Relaxed),
            total_rejected: c.total_rejected.load(Ordering::Relaxed),
        })
    }

    /// Resources with a compartment, sorted
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.compartments).keys().cloned().collect();
        names.sort();
        names
    }
}
