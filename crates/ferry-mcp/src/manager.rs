//! MCP manager, which orchestrates multiple MCP server connections.

use crate::client::{ClientOptions, McpClient};
use crate::config::McpConfig;
use crate::connection::NotificationSender;
use crate::error::McpError;
use crate::state::ConnectionState;
use ferry_session::InteractionLog;
use futures_util::future::join_all;
use std::sync::Arc;

/// A server that could not be brought to `Ready`.
#[derive(Debug)]
pub struct ConnectFailure {
    pub server: String,
    pub error: McpError,
}

/// Per-server status for display.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub description: Option<String>,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub server_info: Option<String>,
}

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    clients: Vec<Arc<McpClient>>,
    failures: Vec<ConnectFailure>,
}

impl McpManager {
    /// Start all enabled MCP servers concurrently.
    ///
    /// Servers that fail to start are recorded in [`failures`](Self::failures)
    /// and skipped; the session continues with whatever servers are available.
    pub async fn start(
        config: &McpConfig,
        log: &InteractionLog,
        observer: Option<NotificationSender>,
    ) -> Self {
        let attempts = config.enabled().map(|(name, server)| {
            let options =
                ClientOptions::from_config(server, log.clone()).with_observer(observer.clone());
            async move { (name.clone(), McpClient::connect(name, server, options).await) }
        });

        let mut clients = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(client) => {
                    tracing::info!(
                        "MCP server '{}' started ({} tools)",
                        name,
                        client.tools().len()
                    );
                    clients.push(Arc::new(client));
                }
                Err(error) => {
                    tracing::warn!("Failed to start MCP server '{name}': {error}");
                    failures.push(ConnectFailure {
                        server: name,
                        error,
                    });
                }
            }
        }

        Self { clients, failures }
    }

    /// A manager over clients that are already connected.
    pub fn from_clients(clients: Vec<Arc<McpClient>>) -> Self {
        Self {
            clients,
            failures: Vec::new(),
        }
    }

    /// Connected clients in configuration order.
    pub fn clients(&self) -> &[Arc<McpClient>] {
        &self.clients
    }

    pub fn failures(&self) -> &[ConnectFailure] {
        &self.failures
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// One line covering every server that could not connect, if any.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let details: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.server, f.error))
            .collect();
        Some(format!(
            "Could not connect to {} MCP server(s): {}",
            self.failures.len(),
            details.join("; ")
        ))
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.clients
            .iter()
            .map(|c| ServerStatus {
                name: c.server_name().to_string(),
                description: c.description().map(str::to_string),
                state: c.state(),
                tool_count: c.tools().len(),
                server_info: c.server_info().label(),
            })
            .collect()
    }

    /// Shut down all connected servers concurrently.
    pub async fn shutdown(&self) {
        join_all(self.clients.iter().map(|c| c.shutdown())).await;
    }
}
