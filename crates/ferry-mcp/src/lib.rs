//! MCP (Model Context Protocol) host side for Ferry.
//!
//! Servers are child processes speaking JSON-RPC 2.0 over stdio, one UTF-8
//! JSON document per `Content-Length` framed message. Each configured server
//! is spawned, initialized with a handshake, and its tools are discovered and
//! merged into one catalog the model can call.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod manager;
pub mod orchestrator;
pub mod process;
pub mod sanitize;
pub mod state;

pub use client::{ClientOptions, McpClient, McpToolContent, McpToolInfo, McpToolResult, ServerInfo};
pub use config::{McpConfig, McpServerConfig};
pub use connection::{McpConnection, NotificationSender, ServerNotification};
pub use error::{FramingError, HandshakeStage, McpError};
pub use framing::{FrameReader, FrameWriter};
pub use manager::{ConnectFailure, McpManager, ServerStatus};
pub use orchestrator::{CatalogEntry, ToolOrchestrator};
pub use process::ServerProcess;
pub use sanitize::{is_valid_tool_name, sanitize_tool_name};
pub use state::{ConnectionState, StateCell};
