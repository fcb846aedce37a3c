//! Degradation switch: deliberately reduced functionality
//!
//! Operators can put a single resource, or everything at once, into
//! degraded mode. Callers consult [`DegradationSwitch::is_degraded`] and run
//! the degraded implementation registered for the resource instead of the
//! normal path.

use crate::error::ResilienceError;
use crate::sync::{read, write};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Degraded implementation for one resource
pub type DegradedFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, ResilienceError>> + Send + Sync>;

/// Global and per-resource degraded-mode flags
#[derive(Clone, Default)]
pub struct DegradationSwitch {
    force_degraded_all: Arc<AtomicBool>,
    degraded: Arc<RwLock<HashSet<String>>>,
    implementations: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl fmt::Debug for DegradationSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationSwitch")
            .field("force_degraded_all", &self.is_globally_degraded())
            .field("degraded", &self.degraded_resources())
            .finish()
    }
}

impl DegradationSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn the global switch on or off
    pub fn set_global(&self, degraded: bool) {
        let previous = self.force_degraded_all.swap(degraded, Ordering::SeqCst);
        if previous != degraded {
            tracing::info!(degraded, "global degradation switch changed");
        }
    }

    pub fn is_globally_degraded(&self) -> bool {
        self.force_degraded_all.load(Ordering::SeqCst)
    }

    /// Mark one resource degraded
    pub fn mark_degraded(&self, resource: &str) {
        if write(&self.degraded).insert(resource.to_string()) {
            tracing::info!(resource = %resource, "resource marked degraded");
        }
    }

    /// Return one resource to normal mode
    pub fn clear_degraded(&self, resource: &str) {
        if write(&self.degraded).remove(resource) {
            tracing::info!(resource = %resource, "resource restored from degraded mode");
        }
    }

    /// True if the global switch is on or `resource` is individually marked
    pub fn is_degraded(&self, resource: &str) -> bool {
        self.is_globally_degraded() || read(&self.degraded).contains(resource)
    }

    /// Individually marked resources, sorted
    pub fn degraded_resources(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.degraded).iter().cloned().collect();
        names.sort();
        names
    }

    /// Bind the degraded implementation for `resource`
    pub fn register_degraded_impl<T, F, Fut>(&self, resource: &str, f: F)
    where
        T: 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let degraded: DegradedFn<T> = Arc::new(move || f().boxed());
        write(&self.implementations).insert(resource.to_string(), Arc::new(degraded));
    }

    pub fn remove_degraded_impl(&self, resource: &str) {
        write(&self.implementations).remove(resource);
    }

    /// Degraded implementation for `resource` with result type `T`
    pub fn degraded_impl<T: 'static>(&self, resource: &str) -> Option<DegradedFn<T>> {
        read(&self.implementations)
            .get(resource)
            .and_then(|f| f.downcast_ref::<DegradedFn<T>>())
            .cloned()
    }

    /// Run `normal` or `degraded`, whichever currently applies
    pub async fn execute<T, N, NF, D, DF>(
        &self,
        resource: &str,
        normal: N,
        degraded: D,
    ) -> Result<T, ResilienceError>
    where
        N: FnOnce() -> NF,
        NF: Future<Output = Result<T, ResilienceError>>,
        D: FnOnce() -> DF,
        DF: Future<Output = Result<T, ResilienceError>>,
    {
        if self.is_degraded(resource) {
            tracing::debug!(resource = %resource, "running degraded path");
            degraded().await
        } else {
            normal().await
        }
    }

    /// Run `normal`, or the registered degraded implementation when degraded
    ///
    /// Fails with [`ResilienceError::Degraded`] if the resource is degraded
    /// and nothing is registered for it.
    pub async fn execute_registered<T, N, NF>(&self, resource: &str, normal: N) -> Result<T, ResilienceError>
    where
        T: 'static,
        N: FnOnce() -> NF,
        NF: Future<Output = Result<T, ResilienceError>>,
    {
        if !self.is_degraded(resource) {
            return normal().await;
        }
        match self.degraded_impl::<T>(resource) {
            Some(degraded) => degraded().await,
            None => Err(ResilienceError::Degraded {
                resource: resource.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_switch_covers_every_resource() {
        let switch = DegradationSwitch::new();
        assert!(!switch.is_degraded("a"));

        switch.set_global(true);
        assert!(switch.is_degraded("a"));
        assert!(switch.is_degraded("anything"));

        switch.set_global(false);
        assert!(!switch.is_degraded("a"));
    }

    #[test]
    fn test_individual_marking() {
        let switch = DegradationSwitch::new();
        switch.mark_degraded("b");
        switch.mark_degraded("a");
        switch.mark_degraded("a");

        assert!(switch.is_degraded("a"));
        assert!(!switch.is_degraded("c"));
        assert_eq!(switch.degraded_resources(), vec!["a", "b"]);

        switch.clear_degraded("a");
        assert!(!switch.is_degraded("a"));
    }

    #[tokio::test]
    async fn test_execute_picks_path() {
        let switch = DegradationSwitch::new();

        let normal = switch
            .execute("a", || async { Ok::<_, ResilienceError>("normal") }, || async { Ok("degraded") })
            .await
            .unwrap();
        assert_eq!(normal, "normal");

        switch.mark_degraded("a");
        let degraded = switch
            .execute("a", || async { Ok::<_, ResilienceError>("normal") }, || async { Ok("degraded") })
            .await
            .unwrap();
        assert_eq!(degraded, "degraded");
    }

    #[tokio::test]
    async fn test_execute_registered() {
        let switch = DegradationSwitch::new();
        switch.mark_degraded("a");

        let missing: Result<u32, _> = switch.execute_registered("a", || async { Ok(1) }).await;
        assert!(matches!(missing, Err(ResilienceError::Degraded { .. })));

        switch.register_degraded_impl("a", || async { Ok(2u32) });
        let value: u32 = switch.execute_registered("a", || async { Ok(1) }).await.unwrap();
        assert_eq!(value, 2);

        switch.clear_degraded("a");
        let value: u32 = switch.execute_registered("a", || async { Ok(1) }).await.unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_impl_lookup_is_typed() {
        let switch = DegradationSwitch::new();
        switch.register_degraded_impl("a", || async { Ok(2u32) });
        assert!(switch.degraded_impl::<u32>("a").is_some());
        assert!(switch.degraded_impl::<String>("a").is_none());

        switch.remove_degraded_impl("a");
        assert!(switch.degraded_impl::<u32>("a").is_none());
    }
}
