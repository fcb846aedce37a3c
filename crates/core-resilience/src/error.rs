//! Error taxonomy shared by every availability gate

use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the gates or surfaced by protected operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded for '{resource}'{}", fmt_retry_after(.retry_after))]
    RateLimitExceeded {
        resource: String,
        retry_after: Option<Duration>,
    },

    /// Admission denied by the circuit breaker
    #[error("Circuit breaker for '{resource}' is {state}, rejecting requests")]
    CircuitOpen {
        resource: String,
        state: CircuitState,
        remaining: Option<Duration>,
    },

    /// No bulkhead slot became available within the wait timeout
    #[error(
        "Bulkhead for '{resource}' is full (max_concurrent={max_concurrent}, queue_capacity={queue_capacity})"
    )]
    BulkheadFull {
        resource: String,
        max_concurrent: usize,
        queue_capacity: usize,
    },

    /// The wrapped call exceeded its deadline
    #[error("Operation on '{resource}' timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout {
        resource: String,
        timeout: Duration,
        elapsed: Duration,
    },

    /// The caller was interrupted while waiting on a gate
    #[error("Wait on '{resource}' was cancelled")]
    Cancelled { resource: String },

    /// The resource is in degraded mode and no degraded path was available
    #[error("Resource '{resource}' is degraded")]
    Degraded { resource: String },

    /// The protected operation panicked
    #[error("Operation on '{resource}' panicked")]
    Panicked { resource: String },

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Caller supplied invalid input; retrying cannot help
    #[error("Validation error: {0}")]
    Validation(String),

    /// The shared counter store could not be reached
    #[error("Counter store error: {0}")]
    Store(String),

    /// Invalid gate configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:?}", d),
        None => String::new(),
    }
}

/// Discriminant of a [`ResilienceError`], used by retry allow/deny lists
/// and as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    RateLimited,
    CircuitOpen,
    BulkheadFull,
    Timeout,
    Cancelled,
    Degraded,
    Panicked,
    Transient,
    Permanent,
    Validation,
    Store,
    Config,
}

impl ErrorKind {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Degraded => "degraded",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Validation => "validation",
            ErrorKind::Store => "store",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "rate_limited" => ErrorKind::RateLimited,
            "circuit_open" => ErrorKind::CircuitOpen,
            "bulkhead_full" => ErrorKind::BulkheadFull,
            "timeout" => ErrorKind::Timeout,
            "cancelled" => ErrorKind::Cancelled,
            "degraded" => ErrorKind::Degraded,
            "panicked" => ErrorKind::Panicked,
            "transient" => ErrorKind::Transient,
            "permanent" => ErrorKind::Permanent,
            "validation" => ErrorKind::Validation,
            "store" => ErrorKind::Store,
            "config" => ErrorKind::Config,
            other => {
                return Err(ResilienceError::Config(format!(
                    "unknown error kind '{}'",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

impl ResilienceError {
    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            ResilienceError::Timeout { .. } => ErrorKind::Timeout,
            ResilienceError::Cancelled { .. } => ErrorKind::Cancelled,
            ResilienceError::Degraded { .. } => ErrorKind::Degraded,
            ResilienceError::Panicked { .. } => ErrorKind::Panicked,
            ResilienceError::Transient(_) => ErrorKind::Transient,
            ResilienceError::Permanent(_) => ErrorKind::Permanent,
            ResilienceError::Validation(_) => ErrorKind::Validation,
            ResilienceError::Store(_) => ErrorKind::Store,
            ResilienceError::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::Timeout { .. }
                | ResilienceError::Store(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_)
                | ResilienceError::Panicked { .. }
                | ResilienceError::Validation(_)
                | ResilienceError::Config(_)
                | ResilienceError::CircuitOpen { .. }
                | ResilienceError::Cancelled { .. }
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::BulkheadFull { .. }
                | ResilienceError::RateLimitExceeded { .. }
                | ResilienceError::Cancelled { .. }
        )
    }

    /// Check if this error was produced by an admission gate rather than the operation
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::RateLimitExceeded { .. }
                | ResilienceError::CircuitOpen { .. }
                | ResilienceError::BulkheadFull { .. }
                | ResilienceError::Degraded { .. }
        )
    }

    /// Resource name carried by gate errors
    pub fn resource(&self) -> Option<&str> {
        match self {
            ResilienceError::RateLimitExceeded { resource, .. }
            | ResilienceError::CircuitOpen { resource, .. }
            | ResilienceError::BulkheadFull { resource, .. }
            | ResilienceError::Timeout { resource, .. }
            | ResilienceError::Cancelled { resource }
            | ResilienceError::Degraded { resource }
            | ResilienceError::Panicked { resource } => Some(resource),
            _ => None,
        }
    }
}
