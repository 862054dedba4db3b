//! Session-specific error types.

use thiserror::Error;

/// Errors that can occur while opening or reading the interaction log.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to open interaction log {path}: {source}")]
    OpenLog {
        path: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
