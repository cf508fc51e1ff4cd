//! Error types for `Nestbox` core library.

use thiserror::Error;

/// Result type alias using `Nestbox` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Nestbox` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Execution input document failed strict validation
    #[error("Invalid execution input: {0}")]
    Protocol(String),

    /// IPC command document failed validation
    #[error("Invalid IPC command: {0}")]
    Command(String),

    /// Schedule expression could not be interpreted
    #[error("Invalid schedule: {0}")]
    Schedule(String),

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
