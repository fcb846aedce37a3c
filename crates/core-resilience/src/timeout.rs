//! Deadlines for operations
//!
//! [`TimeoutExecutor::execute`] runs the operation on its own task and stops
//! waiting once the deadline passes, so the caller gets
//! [`ResilienceError::Timeout`] on time however the operation behaves. The
//! abandoned task is aborted at its next await point.

use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::sync::{read, write};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default deadline for resources without their own
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-resource deadlines
#[derive(Clone)]
pub struct TimeoutExecutor {
    default_timeout: Arc<RwLock<Duration>>,
    timeouts: Arc<RwLock<HashMap<String, Duration>>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for TimeoutExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutExecutor")
            .field("default_timeout", &*read(&self.default_timeout))
            .field("timeouts", &*read(&self.timeouts))
            .finish()
    }
}

impl Default for TimeoutExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

fn validate(timeout: Duration) -> Result<(), ResilienceError> {
    if timeout.is_zero() {
        return Err(ResilienceError::Config("timeout must be > 0".to_string()));
    }
    Ok(())
}

fn from_join_error(resource: &str, err: JoinError) -> ResilienceError {
    if err.is_panic() {
        tracing::error!(resource = %resource, "protected operation panicked");
        ResilienceError::Panicked {
            resource: resource.to_string(),
        }
    } else {
        ResilienceError::Cancelled {
            resource: resource.to_string(),
        }
    }
}

impl TimeoutExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout: Arc::new(RwLock::new(default_timeout)),
            timeouts: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Abort running operations when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_default_timeout(&self, timeout: Duration) -> Result<(), ResilienceError> {
        validate(timeout)?;
        *write(&self.default_timeout) = timeout;
        Ok(())
    }

    /// Set the deadline for `resource`
    pub fn configure(&self, resource: &str, timeout: Duration) -> Result<(), ResilienceError> {
        validate(timeout)?;
        write(&self.timeouts).insert(resource.to_string(), timeout);
        Ok(())
    }

    /// Deadline in force for `resource`
    pub fn timeout_for(&self, resource: &str) -> Duration {
        read(&self.timeouts)
            .get(resource)
            .copied()
            .unwrap_or_else(|| *read(&self.default_timeout))
    }

    fn timed_out(&self, resource: &str, timeout: Duration, started: Instant) -> ResilienceError {
        let elapsed = started.elapsed();
        self.sink.record(&ResilienceEvent::TimedOut {
            resource: resource.to_string(),
            timeout,
            elapsed,
        });
        ResilienceError::Timeout {
            resource: resource.to_string(),
            timeout,
            elapsed,
        }
    }

    /// Run `op` with a deadline
    ///
    /// `timeout` overrides the configured deadline for this call. Errors
    /// returned by the operation pass through unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        timeout: Option<Duration>,
    ) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let limit = timeout.unwrap_or_else(|| self.timeout_for(resource));
        let started = Instant::now();
        let mut handle = tokio::spawn(op());

        tokio::select! {
            _ = self.cancel.cancelled() => {
                handle.abort();
                Err(ResilienceError::Cancelled {
                    resource: resource.to_string(),
                })
            }
            joined = tokio::time::timeout(limit, &mut handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(from_join_error(resource, join_err)),
                Err(_) => {
                    handle.abort();
                    Err(self.timed_out(resource, limit, started))
                }
            },
        }
    }

    /// Run `op` with a deadline on the caller's task
    ///
    /// For futures that cannot be spawned. The deadline only takes effect at
    /// the operation's await points.
    pub async fn execute_local<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        timeout: Option<Duration>,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let limit = timeout.unwrap_or_else(|| self.timeout_for(resource));
        let started = Instant::now();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ResilienceError::Cancelled {
                resource: resource.to_string(),
            }),
            outcome = tokio::time::timeout(limit, op()) => match outcome {
                Ok(result) => result,
                Err(_) => Err(self.timed_out(resource, limit, started)),
            },
        }
    }

    /// Start `op` in the background with a deadline
    ///
    /// The returned handle resolves to the same result [`execute`](Self::execute)
    /// would produce.
    pub fn spawn<T, F, Fut>(
        &self,
        resource: &str,
        op: F,
        timeout: Option<Duration>,
    ) -> JoinHandle<Result<T, ResilienceError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let executor = self.clone();
        let resource = resource.to_string();
        tokio::spawn(async move { executor.execute(&resource, op, timeout).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_fast_operation_completes() {
        let executor = TimeoutExecutor::new(Duration::from_secs(1));
        let value = executor
            .execute("r", || async { Ok::<_, ResilienceError>(42) }, None)
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out_on_schedule() {
        let sink = Arc::new(RecordingSink::default());
        let executor = TimeoutExecutor::default().with_sink(sink.clone());
        executor.configure("r", Duration::from_millis(100)).unwrap();

        let started = Instant::now();
        let result: Result<(), _> = executor
            .execute(
                "r",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                None,
            )
            .await;

        match result {
            Err(ResilienceError::Timeout {
                resource, timeout, ..
            }) => {
                assert_eq!(resource, "r");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(sink.events()[0], ResilienceEvent::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_task_is_aborted() {
        let executor = TimeoutExecutor::new(Duration::from_millis(10));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<(), _> = executor
            .execute(
                "r",
                move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_operation_error_passes_through() {
        let executor = TimeoutExecutor::default();
        let result: Result<(), _> = executor
            .execute(
                "r",
                || async { Err(ResilienceError::Validation("bad".to_string())) },
                None,
            )
            .await;
        assert_eq!(result, Err(ResilienceError::Validation("bad".to_string())));
    }

    #[tokio::test]
    async fn test_panic_becomes_panicked_error() {
        let executor = TimeoutExecutor::default();
        let result: Result<(), _> = executor
            .execute(
                "r",
                || async {
                    let missing: Option<()> = None;
                    missing.expect("boom");
                    Ok(())
                },
                None,
            )
            .await;
        assert_eq!(
            result,
            Err(ResilienceError::Panicked {
                resource: "r".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_override_and_cancellation() {
        let cancel = CancellationToken::new();
        let executor = TimeoutExecutor::new(Duration::from_secs(600)).with_cancellation(cancel.clone());

        let result: Result<(), _> = executor
            .execute(
                "r",
                || async {
                    std::future::pending::<()>().await;
                    Ok(())
                },
                Some(Duration::from_millis(5)),
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));

        let handle = executor.spawn(
            "r",
            || async {
                std::future::pending::<()>().await;
                Ok::<(), ResilienceError>(())
            },
            None,
        );
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(
            handle.await.unwrap(),
            Err(ResilienceError::Cancelled {
                resource: "r".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_local() {
        let executor = TimeoutExecutor::new(Duration::from_millis(20));
        let borrowed = String::from("local");
        let value = executor
            .execute_local("r", || async { Ok::<_, ResilienceError>(borrowed.len()) }, None)
            .await
            .unwrap();
        assert_eq!(value, 5);

        let result: Result<(), _> = executor
            .execute_local(
                "r",
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    }

    #[test]
    fn test_configuration() {
        let executor = TimeoutExecutor::default();
        assert_eq!(executor.timeout_for("x"), DEFAULT_TIMEOUT);
        executor.configure("x", Duration::from_millis(250)).unwrap();
        assert_eq!(executor.timeout_for("x"), Duration::from_millis(250));
        assert!(executor.configure("x", Duration::ZERO).is_err());
        assert!(executor.set_default_timeout(Duration::ZERO).is_err());
    }
}
