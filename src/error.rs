/*!
 * Error types for Rampart
 */

use rampart_core_resilience::ResilienceError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RampartError>;

#[derive(Debug, Error)]
pub enum RampartError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error reading or writing configuration or log files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Subscriber initialization failed
    #[error("Logging error: {0}")]
    Logging(String),

    /// Metric creation or registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A gate rejected the call or the protected operation failed
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl RampartError {
    /// Check if this error came from a gate rejecting the call
    pub fn is_rejection(&self) -> bool {
        matches!(self, RampartError::Resilience(e) if e.is_rejection())
    }

    /// The resilience error, if this is one
    pub fn as_resilience(&self) -> Option<&ResilienceError> {
        match self {
            RampartError::Resilience(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_errors_are_transparent() {
        let inner = ResilienceError::Degraded {
            resource: "search".to_string(),
        };
        let wrapped: RampartError = inner.clone().into();
        assert_eq!(wrapped.to_string(), inner.to_string());
        assert_eq!(wrapped.as_resilience(), Some(&inner));
        assert!(wrapped.is_rejection());
    }

    #[test]
    fn test_config_error_display() {
        let err = RampartError::Config("bad ratio".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad ratio");
        assert!(!err.is_rejection());
        assert!(err.as_resilience().is_none());
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse = toml::from_str::<toml::Value>("not = [valid").unwrap_err();
        let err: RampartError = parse.into();
        assert!(matches!(err, RampartError::Toml(_)));
    }
}
