//! Error types for the RateGate service.

use thiserror::Error;

use crate::ratelimit::RequestError;
use crate::store::StoreError;

/// Main error type for RateGate operations.
#[derive(Error, Debug)]
pub enum RateGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit request could not be built
    #[error("Invalid rate limit request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Failures reported by an identity, policy or usage log collaborator
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateGateError {
    fn from(err: config::ConfigError) -> Self {
        RateGateError::Config(err.to_string())
    }
}

/// Result type alias for RateGate operations.
pub type Result<T> = std::result::Result<T, RateGateError>;
