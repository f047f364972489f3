//! Error types for the Lokai core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Lokai operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A framed line that is not a well-formed JSON record
    #[error("Malformed record: {reason}")]
    MalformedRecord { reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
