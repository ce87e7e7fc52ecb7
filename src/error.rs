//! Error types for the admission controller.

use thiserror::Error;

/// Main error type for window-throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiting is enabled but a required setting is absent
    #[error("Configuration error: `{0}` must be defined when rate limiting is enabled")]
    MissingSetting(&'static str),

    /// Match method outside of `and` / `or`
    #[error("Invalid match method `{0}`")]
    UnknownMatchMethod(String),

    /// Field name with no extraction rule
    #[error("Unknown match field `{0}`")]
    UnknownField(String),

    /// Deny status that is not a valid HTTP status code
    #[error("Invalid deny status code: {0}")]
    InvalidStatusCode(u16),

    /// Window duration that cannot be parsed or represented
    #[error("Invalid window duration: {0}")]
    InvalidDuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ThrottleError {
    fn from(err: config::ConfigError) -> Self {
        ThrottleError::Config(err.to_string())
    }
}

/// Result type alias for window-throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
