/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{RampartError, Result};

/// Filter directive for both rampart crates at `level`
fn default_directive(config: &LoggingConfig) -> String {
    let level = config.level.to_tracing_level();
    format!("rampart={level},rampart_core_resilience={level}")
}

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(config)))
        .map_err(|e| RampartError::Logging(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = config.json_file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stdout_logging(env_filter)
    }
}

/// Initialize logging to stdout
fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RampartError::Logging(e.to_string()))
}

/// Initialize JSON logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| RampartError::Logging(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RampartError::Logging(e.to_string()))
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("rampart=debug,rampart_core_resilience=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use tempfile::tempdir;

    #[test]
    fn test_default_directive_covers_both_crates() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            json_file: None,
        };
        assert_eq!(
            default_directive(&config),
            "rampart=WARN,rampart_core_resilience=WARN"
        );
        assert!(EnvFilter::try_new(default_directive(&config)).is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        init_test_logging();

        // The test subscriber is already global, so this must fail cleanly
        let config = LoggingConfig::default();
        let result = init_logging(&config);
        assert!(matches!(result, Err(RampartError::Logging(_))));
    }

    #[test]
    fn test_unwritable_log_file() {
        let dir = tempdir().unwrap();
        let config = LoggingConfig {
            level: LogLevel::Info,
            json_file: Some(dir.path().join("missing").join("rampart.json")),
        };
        let result = init_logging(&config);
        assert!(matches!(result, Err(RampartError::Logging(_))));
    }
}
