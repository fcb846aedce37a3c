//! Fallbacks: substitute results when a protected call cannot produce one
//!
//! The registry holds, per resource:
//! - an optional default handler (constant value or function of the error)
//! - an optional redirect operation (an alternative async call)
//! - the last successful result, which powers [`FallbackStrategy::Cached`]
//! - an optional preferred strategy
//!
//! Values are stored type-erased and recovered by downcasting, so one
//! registry can serve resources returning different types. A lookup with the
//! wrong type behaves as if nothing was registered.
//!
//! # Example
//!
//! ```
//! use rampart_core_resilience::fallback::FallbackRegistry;
//!
//! let fallbacks = FallbackRegistry::new();
//! fallbacks.record_success("prices", &vec![10u32, 20]);
//!
//! let cached: Option<Vec<u32>> = fallbacks.cached("prices");
//! assert_eq!(cached, Some(vec![10, 20]));
//! assert_eq!(fallbacks.cached::<Vec<u32>>("unknown"), None);
//! ```

use crate::degradation::DegradationSwitch;
use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::sync::{read, write};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Substitute-value function receiving the triggering error
pub type FallbackFn<T> = Arc<dyn Fn(&ResilienceError) -> Result<T, ResilienceError> + Send + Sync>;

/// Alternative operation invoked with the triggering error
pub type RedirectFn<T> =
    Arc<dyn Fn(ResilienceError) -> BoxFuture<'static, Result<T, ResilienceError>> + Send + Sync>;

type Erased = Arc<dyn Any + Send + Sync>;

/// How to produce a result once the primary path has failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackStrategy {
    /// Return no value
    Empty,
    /// Invoke the registered default handler with the error
    DefaultValue,
    /// Return the last successful result, if any
    Cached,
    /// Run the degraded implementation registered with the degradation switch
    Degraded,
    /// Re-raise the original error
    Throw,
    /// Call the registered redirect; if that fails too, re-raise the original error
    Redirect,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Empty => "empty",
            FallbackStrategy::DefaultValue => "default_value",
            FallbackStrategy::Cached => "cached",
            FallbackStrategy::Degraded => "degraded",
            FallbackStrategy::Throw => "throw",
            FallbackStrategy::Redirect => "redirect",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FallbackStrategy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(FallbackStrategy::Empty),
            "default_value" | "default" => Ok(FallbackStrategy::DefaultValue),
            "cached" => Ok(FallbackStrategy::Cached),
            "degraded" => Ok(FallbackStrategy::Degraded),
            "throw" => Ok(FallbackStrategy::Throw),
            "redirect" => Ok(FallbackStrategy::Redirect),
            other => Err(ResilienceError::Config(format!(
                "unknown fallback strategy '{}'",
                other
            ))),
        }
    }
}

/// Run `fallback` for a failed call
///
/// Returns the fallback's value, or the original error if the fallback
/// fails. Cancellation is never masked.
pub fn recover_with<T, FB>(
    resource: &str,
    error: ResilienceError,
    fallback: FB,
    sink: &dyn EventSink,
) -> Result<T, ResilienceError>
where
    FB: FnOnce(&ResilienceError) -> Result<T, ResilienceError>,
{
    if matches!(error, ResilienceError::Cancelled { .. }) {
        return Err(error);
    }

    match fallback(&error) {
        Ok(value) => {
            sink.record(&ResilienceEvent::FallbackInvoked {
                resource: resource.to_string(),
            });
            Ok(value)
        }
        Err(fallback_err) => {
            sink.record(&ResilienceEvent::FallbackFailed {
                resource: resource.to_string(),
                error: fallback_err.to_string(),
            });
            Err(error)
        }
    }
}

/// Per-resource fallback handlers and last-known-good results
#[derive(Clone)]
pub struct FallbackRegistry {
    handlers: Arc<RwLock<HashMap<String, Erased>>>,
    redirects: Arc<RwLock<HashMap<String, Erased>>>,
    last_success: Arc<RwLock<HashMap<String, Erased>>>,
    strategies: Arc<RwLock<HashMap<String, FallbackStrategy>>>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("handlers", &read(&self.handlers).len())
            .field("redirects", &read(&self.redirects).len())
            .field("cached", &read(&self.last_success).len())
            .field("strategies", &*read(&self.strategies))
            .finish()
    }
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            redirects: Arc::new(RwLock::new(HashMap::new())),
            last_success: Arc::new(RwLock::new(HashMap::new())),
            strategies: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(TracingSink),
        }
    }

    /// Route events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a substitute-value function for `resource`
    pub fn register_fn<T, F>(&self, resource: &str, f: F)
    where
        T: 'static,
        F: Fn(&ResilienceError) -> Result<T, ResilienceError> + Send + Sync + 'static,
    {
        let handler: FallbackFn<T> = Arc::new(f);
        write(&self.handlers).insert(resource.to_string(), Arc::new(handler));
    }

    /// Register a constant default for `resource`
    pub fn register_value<T>(&self, resource: &str, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register_fn(resource, move |_| Ok(value.clone()));
    }

    /// Register an alternative operation for [`FallbackStrategy::Redirect`]
    pub fn register_redirect<T, F, Fut>(&self, resource: &str, f: F)
    where
        T: 'static,
        F: Fn(ResilienceError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let redirect: RedirectFn<T> = Arc::new(move |err: ResilienceError| f(err).boxed());
        write(&self.redirects).insert(resource.to_string(), Arc::new(redirect));
    }

    /// Default handler registered for `resource` with result type `T`
    pub fn handler<T: 'static>(&self, resource: &str) -> Option<FallbackFn<T>> {
        downcast(resource, read(&self.handlers).get(resource))
    }

    /// Redirect registered for `resource` with result type `T`
    pub fn redirect<T: 'static>(&self, resource: &str) -> Option<RedirectFn<T>> {
        downcast(resource, read(&self.redirects).get(resource))
    }

    pub fn has_handler(&self, resource: &str) -> bool {
        read(&self.handlers).contains_key(resource)
    }

    /// Remember `value` as the last successful result for `resource`
    pub fn record_success<T>(&self, resource: &str, value: &T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let erased: Erased = Arc::new(value.clone());
        write(&self.last_success).insert(resource.to_string(), erased);
    }

    /// Last successful result recorded for `resource`
    pub fn cached<T>(&self, resource: &str) -> Option<T>
    where
        T: Clone + 'static,
    {
        read(&self.last_success)
            .get(resource)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn clear_cache(&self, resource: &str) {
        write(&self.last_success).remove(resource);
    }

    /// Preferred strategy for `resource`
    pub fn set_strategy(&self, resource: &str, strategy: FallbackStrategy) {
        write(&self.strategies).insert(resource.to_string(), strategy);
    }

    pub fn strategy(&self, resource: &str) -> Option<FallbackStrategy> {
        read(&self.strategies).get(resource).copied()
    }

    /// Forget everything registered or cached for `resource`
    pub fn remove(&self, resource: &str) {
        write(&self.handlers).remove(resource);
        write(&self.redirects).remove(resource);
        write(&self.last_success).remove(resource);
        write(&self.strategies).remove(resource);
    }

    /// Produce a fallback result for `error` under `strategy`
    ///
    /// `Ok(None)` means "no value" (Empty, or Cached with nothing recorded).
    /// `Err` carries the original error whenever the strategy cannot supply a
    /// value.
    pub async fn resolve<T>(
        &self,
        resource: &str,
        strategy: FallbackStrategy,
        error: ResilienceError,
        degradation: &DegradationSwitch,
    ) -> Result<Option<T>, ResilienceError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if matches!(error, ResilienceError::Cancelled { .. }) {
            return Err(error);
        }

        let outcome = match strategy {
            FallbackStrategy::Throw => return Err(error),
            FallbackStrategy::Empty => Ok(None),
            FallbackStrategy::Cached => Ok(self.cached::<T>(resource)),
            FallbackStrategy::DefaultValue => match self.handler::<T>(resource) {
                Some(handler) => handler(&error).map(Some),
                None => return Err(error),
            },
            FallbackStrategy::Degraded => match degradation.degraded_impl::<T>(resource) {
                Some(degraded) => degraded().await.map(Some),
                None => return Err(error),
            },
            FallbackStrategy::Redirect => match self.redirect::<T>(resource) {
                Some(redirect) => redirect(error.clone()).await.map(Some),
                None => return Err(error),
            },
        };

        match outcome {
            Ok(value) => {
                self.sink.record(&ResilienceEvent::FallbackInvoked {
                    resource: resource.to_string(),
                });
                Ok(value)
            }
            Err(fallback_err) => {
                self.sink.record(&ResilienceEvent::FallbackFailed {
                    resource: resource.to_string(),
                    error: fallback_err.to_string(),
                });
                Err(error)
            }
        }
    }
}

fn downcast<F: Clone + 'static>(resource: &str, entry: Option<&Erased>) -> Option<F> {
    let entry = entry?;
    match entry.downcast_ref::<F>() {
        Some(f) => Some(f.clone()),
        None => {
            tracing::warn!(resource = %resource, "fallback registered with a different result type");
            None
        }
    }
}
