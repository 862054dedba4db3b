//! Error types for MCP operations.

use crate::state::ConnectionState;
use std::fmt;
use thiserror::Error;

/// Errors from reading or writing length-prefixed frames.
///
/// Every variant except `Io` on write means the byte stream can no longer be
/// trusted; the connection that owns it is closed.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame header is missing Content-Length")]
    MissingContentLength,

    #[error("malformed frame header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid Content-Length value: {0:?}")]
    InvalidLength(String),

    #[error("frame header line exceeds {max} bytes")]
    HeaderTooLong { max: usize },

    #[error("declared body of {declared} bytes exceeds limit of {max}")]
    TooLarge { declared: usize, max: usize },

    #[error("stream ended mid-frame: expected {expected} body bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("stream ended inside a frame header")]
    TruncatedHeader,

    #[error("frame body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Initialize,
    Initialized,
    ToolsList,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialize => "initialize",
            Self::Initialized => "initialized notification",
            Self::ToolsList => "tools/list",
        })
    }
}

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}': {source}")]
    SpawnFailed {
        server: String,
        source: std::io::Error,
    },

    #[error("Framing error on '{server}': {source}")]
    Framing {
        server: String,
        source: FramingError,
    },

    #[error("Handshake with '{server}' failed at {stage}: {source}")]
    Handshake {
        server: String,
        stage: HandshakeStage,
        source: Box<McpError>,
    },

    #[error("MCP request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Connection to '{server}' closed: {reason}")]
    ConnectionClosed { server: String, reason: String },

    #[error("Connection to '{server}' is not ready (state: {state})")]
    NotReady {
        server: String,
        state: ConnectionState,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. }
                | Self::Framing { .. }
                | Self::Handshake { .. }
                | Self::ConnectionClosed { .. }
        )
    }
}
