//! Error types for the pairs pipeline.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pairs pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data error (invalid or malformed input).
    #[error("Data error: {0}")]
    Data(String),

    /// Bars handed to the analytics engine do not describe the same pair slot.
    #[error("Misaligned bars: {0}")]
    Misaligned(String),

    /// Numerical computation failed (singular system, divergence).
    #[error("Computation error: {0}")]
    Computation(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    /// Create a misalignment error.
    pub fn misaligned(msg: impl Into<String>) -> Self {
        Error::Misaligned(msg.into())
    }

    /// Create a computation error.
    pub fn computation(msg: impl Into<String>) -> Self {
        Error::Computation(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }
}
