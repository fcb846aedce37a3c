/*!
 * Configuration for the availability kernel
 *
 * Loaded from TOML. Every section is optional; missing values take the
 * defaults below. Durations are whole milliseconds.
 *
 * ```toml
 * [logging]
 * level = "info"
 *
 * [defaults]
 * timeout_ms = 1000
 *
 * [defaults.circuit_breaker]
 * failure_ratio = 0.5
 * request_volume_threshold = 20
 *
 * [resources.payments]
 * rate_limit = { max_permits = 100, window_ms = 1000 }
 * timeout_ms = 250
 * fallback = "cached"
 * ```
 */

use rampart_core_resilience::{
    BackoffStrategy, BulkheadRule, CircuitBreakerRule, ErrorKind, FallbackStrategy, RateLimitRule,
    ResilienceError, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RampartError, Result};

/// Top-level kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rules applied to resources without their own
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Per-resource overrides, keyed by resource name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON lines to this file instead of compact text to stdout
    #[serde(default)]
    pub json_file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Kernel-wide defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    /// Deadline for a whole protected call, retries included
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause between polls of a blocking rate-limit acquire
    #[serde(default = "default_poll_interval_ms")]
    pub acquire_poll_interval_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            bulkhead: BulkheadConfig::default(),
            timeout_ms: default_timeout_ms(),
            acquire_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DefaultsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    #[serde(default = "default_request_volume_threshold")]
    pub request_volume_threshold: u32,

    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            request_volume_threshold: default_request_volume_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_success_threshold: default_half_open_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn to_rule(&self) -> CircuitBreakerRule {
        CircuitBreakerRule::new(
            self.failure_ratio,
            self.request_volume_threshold,
            Duration::from_millis(self.open_duration_ms),
            self.half_open_success_threshold,
        )
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,

    /// fixed, linear or exponential
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Only retry these error kinds (e.g. "transient", "timeout")
    #[serde(default)]
    pub retry_on: Option<Vec<String>>,

    /// Never retry these error kinds; replaces the built-in list when set
    #[serde(default)]
    pub abort_on: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: 0,
            strategy: default_strategy(),
            retry_on: None,
            abort_on: None,
        }
    }
}

fn parse_kinds(kinds: &[String]) -> std::result::Result<HashSet<ErrorKind>, ResilienceError> {
    kinds.iter().map(|k| k.parse::<ErrorKind>()).collect()
}

impl RetryConfig {
    pub fn to_policy(&self) -> std::result::Result<RetryPolicy, ResilienceError> {
        let strategy: BackoffStrategy = self.strategy.parse()?;
        let mut policy = RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            strategy,
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
        .with_jitter(Duration::from_millis(self.jitter_ms));

        if let Some(retry_on) = &self.retry_on {
            policy.retry_on = Some(parse_kinds(retry_on)?);
        }
        if let Some(abort_on) = &self.abort_on {
            let mut kinds = parse_kinds(abort_on)?;
            // Cancellation is never retried, whatever the list says
            kinds.insert(ErrorKind::Cancelled);
            policy.abort_on = kinds;
        }
        Ok(policy)
    }
}

/// Bulkhead settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Zero fails immediately when every slot is taken
    #[serde(default)]
    pub wait_timeout_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            wait_timeout_ms: 0,
        }
    }
}

impl BulkheadConfig {
    pub fn to_rule(&self) -> BulkheadRule {
        BulkheadRule::new(
            self.max_concurrent,
            self.queue_capacity,
            Duration::from_millis(self.wait_timeout_ms),
        )
    }
}

/// Fixed-window quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_permits: u64,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn to_rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.max_permits, Duration::from_millis(self.window_ms))
    }
}

/// Overrides for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceConfig {
    /// Quota; resources without one are not rate limited
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub bulkhead: Option<BulkheadConfig>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Strategy used by strategy-driven protection (empty, default_value,
    /// cached, degraded, throw, redirect)
    #[serde(default)]
    pub fallback: Option<String>,

    /// Start in degraded mode
    #[serde(default)]
    pub degraded: bool,
}

impl ResourceConfig {
    pub fn fallback_strategy(&self) -> std::result::Result<Option<FallbackStrategy>, ResilienceError> {
        self.fallback.as_deref().map(str::parse).transpose()
    }
}

// Default value functions for serde
fn default_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_request_volume_threshold() -> u32 {
    20
}

fn default_open_duration_ms() -> u64 {
    5000
}

fn default_half_open_success_threshold() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_strategy() -> String {
    "exponential".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    10
}

fn invalid(section: &str, err: ResilienceError) -> RampartError {
    match err {
        ResilienceError::Config(msg) => RampartError::Config(format!("{}: {}", section, msg)),
        other => RampartError::Config(format!("{}: {}", section, other)),
    }
}

fn validate_timeout(section: &str, timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 {
        return Err(RampartError::Config(format!("{}: timeout_ms must be > 0", section)));
    }
    Ok(())
}

impl KernelConfig {
    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: KernelConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every rule the runtime would build from this configuration
    pub fn validate(&self) -> Result<()> {
        let d = &self.defaults;
        d.circuit_breaker
            .to_rule()
            .validate()
            .map_err(|e| invalid("defaults.circuit_breaker", e))?;
        d.retry
            .to_policy()
            .and_then(|p| p.validate())
            .map_err(|e| invalid("defaults.retry", e))?;
        d.bulkhead
            .to_rule()
            .validate()
            .map_err(|e| invalid("defaults.bulkhead", e))?;
        validate_timeout("defaults", d.timeout_ms)?;
        if d.acquire_poll_interval_ms == 0 {
            return Err(RampartError::Config(
                "defaults: acquire_poll_interval_ms must be > 0".to_string(),
            ));
        }

        for (name, resource) in &self.resources {
            let section = format!("resources.{}", name);
            if name.trim().is_empty() {
                return Err(RampartError::Config("resource names must not be empty".to_string()));
            }
            if let Some(rate_limit) = &resource.rate_limit {
                rate_limit
                    .to_rule()
                    .validate()
                    .map_err(|e| invalid(&section, e))?;
            }
            if let Some(cb) = &resource.circuit_breaker {
                cb.to_rule().validate().map_err(|e| invalid(&section, e))?;
            }
            if let Some(retry) = &resource.retry {
                retry
                    .to_policy()
                    .and_then(|p| p.validate())
                    .map_err(|e| invalid(&section, e))?;
            }
            if let Some(bulkhead) = &resource.bulkhead {
                bulkhead.to_rule().validate().map_err(|e| invalid(&section, e))?;
            }
            if let Some(timeout_ms) = resource.timeout_ms {
                validate_timeout(&section, timeout_ms)?;
            }
            resource
                .fallback_strategy()
                .map_err(|e| invalid(&section, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[logging]
level = "debug"

[defaults]
timeout_ms = 2000

[defaults.circuit_breaker]
failure_ratio = 0.25
request_volume_threshold = 8

[defaults.retry]
max_retries = 2
strategy = "linear"
abort_on = ["permanent", "validation"]

[resources.payments]
rate_limit = { max_permits = 100, window_ms = 1000 }
timeout_ms = 250
fallback = "cached"

[resources.search.bulkhead]
max_concurrent = 4
queue_capacity = 2
wait_timeout_ms = 50
"#;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.defaults.timeout(), Duration::from_secs(1));
        assert_eq!(config.defaults.circuit_breaker.to_rule(), CircuitBreakerRule::default());
        assert!(config.resources.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sample() {
        let config = KernelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.defaults.timeout_ms, 2000);
        assert_eq!(config.defaults.acquire_poll_interval_ms, 10);

        let cb = config.defaults.circuit_breaker.to_rule();
        assert_eq!(cb.failure_ratio, 0.25);
        assert_eq!(cb.request_volume_threshold, 8);
        assert_eq!(cb.open_duration, Duration::from_secs(5));

        let retry = config.defaults.retry.to_policy().unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.strategy, BackoffStrategy::Linear);
        assert!(retry.abort_on.contains(&ErrorKind::Cancelled));
        assert!(!retry.abort_on.contains(&ErrorKind::CircuitOpen));

        let payments = &config.resources["payments"];
        assert_eq!(
            payments.rate_limit.unwrap().to_rule(),
            RateLimitRule::new(100, Duration::from_secs(1))
        );
        assert_eq!(payments.timeout_ms, Some(250));
        assert_eq!(
            payments.fallback_strategy().unwrap(),
            Some(FallbackStrategy::Cached)
        );

        let search = config.resources["search"].bulkhead.as_ref().unwrap();
        assert_eq!(search.to_rule(), BulkheadRule::new(4, 2, Duration::from_millis(50)));
    }

    #[test]
    fn test_file_round_trip() {
        let config = KernelConfig::from_toml_str(SAMPLE).unwrap();
        let file = NamedTempFile::new().unwrap();

        config.to_file(file.path()).unwrap();
        let loaded = KernelConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rejects_invalid_rules() {
        let cases = [
            "[defaults.circuit_breaker]\nfailure_ratio = 1.5",
            "[defaults.circuit_breaker]\nrequest_volume_threshold = 0",
            "[defaults.circuit_breaker]\nhalf_open_success_threshold = 0",
            "[defaults.retry]\nbase_delay_ms = 500\nmax_delay_ms = 100",
            "[defaults.retry]\nstrategy = \"random\"",
            "[defaults.retry]\nretry_on = [\"sometimes\"]",
            "[defaults.bulkhead]\nmax_concurrent = 0",
            "[defaults]\ntimeout_ms = 0",
            "[resources.a]\nrate_limit = { max_permits = 0, window_ms = 1000 }",
            "[resources.a]\nrate_limit = { max_permits = 5, window_ms = 0 }",
            "[resources.a]\nfallback = \"pray\"",
            "[resources.a]\ntimeout_ms = 0",
        ];
        for case in cases {
            let result = KernelConfig::from_toml_str(case);
            assert!(
                matches!(result, Err(RampartError::Config(_))),
                "expected config error for {:?}, got {:?}",
                case,
                result
            );
        }
    }

    #[test]
    fn test_missing_file() {
        let result = KernelConfig::from_file("/nonexistent/rampart.toml");
        assert!(matches!(result, Err(RampartError::Io(_))));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
