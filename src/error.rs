//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Admission itself never fails; these cover startup and serving only.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
