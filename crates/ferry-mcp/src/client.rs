//! MCP client that manages one server connection.
//!
//! Handles the MCP protocol handshake (initialize, then the initialized
//! notification, then tools/list), and tool invocation (tools/call).

use crate::config::{McpServerConfig, DEFAULT_TIMEOUT_MS, DEFAULT_TOOL_TIMEOUT_MS, SHUTDOWN_GRACE};
use crate::connection::{McpConnection, NotificationSender};
use crate::error::{HandshakeStage, McpError};
use crate::framing::{FrameReader, FrameWriter};
use crate::process::ServerProcess;
use crate::state::{ConnectionState, StateCell};
use ferry_session::{InteractionLog, LogEvent, LogKind};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::task::JoinHandle;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Guard against servers that hand back cursors forever.
const MAX_TOOL_PAGES: usize = 100;

/// A tool descriptor as the server advertised it.
///
/// Shape is checked by the orchestrator, not here, so a bad entry does not
/// sink the whole catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<serde_json::Value>,
}

impl McpToolInfo {
    fn from_value(value: &serde_json::Value) -> Self {
        Self {
            name: value["name"].as_str().unwrap_or_default().to_string(),
            description: value["description"].as_str().map(str::to_string),
            input_schema: value.get("inputSchema").cloned(),
        }
    }
}

/// What the server said about itself in its `initialize` result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Name and version of an MCP implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl ServerInfo {
    /// `name version` for display, if the server identified itself.
    pub fn label(&self) -> Option<String> {
        self.server_info.as_ref().map(|i| match &i.version {
            Some(v) => format!("{} {v}", i.name),
            None => i.name.clone(),
        })
    }
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolResult {
    pub content: Vec<McpToolContent>,
    pub is_error: bool,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum McpToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    Resource {
        uri: Option<String>,
        text: Option<String>,
        mime_type: Option<String>,
    },
    /// A content kind this client does not model, kept verbatim.
    Other(serde_json::Value),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum KnownContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
}

#[derive(Deserialize)]
struct EmbeddedResource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "mimeType")]
    mime_type: Option<String>,
}

impl McpToolContent {
    fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<KnownContent>(value.clone()) {
            Ok(KnownContent::Text { text }) => Self::Text { text },
            Ok(KnownContent::Image { data, mime_type }) => Self::Image { data, mime_type },
            Ok(KnownContent::Resource { resource }) => Self::Resource {
                uri: resource.uri,
                text: resource.text,
                mime_type: resource.mime_type,
            },
            Err(_) => Self::Other(value),
        }
    }
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<serde_json::Value>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<serde_json::Value>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

/// Settings for a client that are not about how to launch the server.
#[derive(Clone)]
pub struct ClientOptions {
    pub description: Option<String>,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
    pub log: InteractionLog,
    pub observer: Option<NotificationSender>,
}

impl ClientOptions {
    pub fn new(log: InteractionLog) -> Self {
        Self {
            description: None,
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            tool_timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
            log,
            observer: None,
        }
    }

    pub fn from_config(config: &McpServerConfig, log: InteractionLog) -> Self {
        Self {
            description: config.description.clone(),
            request_timeout: config.request_timeout(),
            tool_timeout: config.tool_timeout(),
            log,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<NotificationSender>) -> Self {
        self.observer = observer;
        self
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    name: String,
    description: Option<String>,
    connection: Arc<McpConnection>,
    process: Option<Arc<ServerProcess>>,
    exit_watcher: Option<JoinHandle<()>>,
    server_info: ServerInfo,
    tools: Vec<McpToolInfo>,
    tool_timeout: Duration,
    log: InteractionLog,
}

impl McpClient {
    /// Connect to an MCP server: spawn, handshake, discover tools.
    pub async fn connect(
        name: &str,
        config: &McpServerConfig,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let state = StateCell::new();
        state.transition(ConnectionState::Starting);
        options.log.record(LogEvent::new(
            name,
            LogKind::Connection,
            json!({"status": "starting", "command": config.command}),
        ));

        let mut process = ServerProcess::launch(name, config, SHUTDOWN_GRACE, &options.log)
            .inspect_err(|e| {
                options.log.record(LogEvent::new(
                    name,
                    LogKind::Error,
                    json!({"stage": "spawn", "error": e.to_string()}),
                ));
            })?;
        let (stdin, stdout) = process.take_stdio()?;
        let process = Arc::new(process);

        let connection = Arc::new(McpConnection::attach(
            name,
            FrameReader::new(BufReader::new(stdout)),
            FrameWriter::new(stdin),
            state,
            options.log.clone(),
            options.observer.clone(),
        ));

        // Process exit closes the connection, failing anything still pending.
        let exit_watcher = {
            let connection = Arc::clone(&connection);
            let process = Arc::clone(&process);
            tokio::spawn(async move {
                let exit = process.wait().await;
                connection.close(format!("server {exit}")).await;
            })
        };

        Self::establish(name, connection, Some(process), Some(exit_watcher), options).await
    }

    /// Run the handshake over streams that are already connected to a server,
    /// such as an in-process one.
    pub async fn connect_streams<R, W>(
        name: &str,
        reader: R,
        writer: W,
        options: ClientOptions,
    ) -> Result<Self, McpError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = StateCell::new();
        state.transition(ConnectionState::Starting);
        let connection = Arc::new(McpConnection::attach(
            name,
            FrameReader::new(reader),
            FrameWriter::new(writer),
            state,
            options.log.clone(),
            options.observer.clone(),
        ));
        Self::establish(name, connection, None, None, options).await
    }

    async fn establish(
        name: &str,
        connection: Arc<McpConnection>,
        process: Option<Arc<ServerProcess>>,
        exit_watcher: Option<JoinHandle<()>>,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let (server_info, tools) = match handshake(&connection, options.request_timeout).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Handshake with '{name}' failed: {e}");
                options.log.record(LogEvent::new(
                    name,
                    LogKind::Error,
                    json!({"stage": "handshake", "error": e.to_string()}),
                ));
                connection.close(format!("handshake failed: {e}")).await;
                if let Some(process) = &process {
                    process.terminate().await;
                }
                if let Some(watcher) = exit_watcher {
                    watcher.abort();
                }
                return Err(e);
            }
        };

        tracing::info!("MCP server '{name}' connected with {} tools", tools.len());
        options.log.record(LogEvent::new(
            name,
            LogKind::Connection,
            json!({
                "status": "ready",
                "server": server_info.label(),
                "protocol_version": server_info.protocol_version,
                "tools": tools.len(),
            }),
        ));

        Ok(Self {
            name: name.to_string(),
            description: options.description,
            connection,
            process,
            exit_watcher,
            server_info,
            tools,
            tool_timeout: options.tool_timeout,
            log: options.log,
        })
    }

    /// Call a tool on this server by its original (unsanitized) name.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, McpError> {
        self.call_tool_with_timeout(tool_name, arguments, self.tool_timeout)
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<McpToolResult, McpError> {
        let params = json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self
            .connection
            .call("tools/call", Some(params), timeout)
            .await?;

        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;

        Ok(McpToolResult {
            content: call_result
                .content
                .into_iter()
                .map(McpToolContent::from_value)
                .collect(),
            is_error: call_result.is_error,
        })
    }

    /// Get the tools exposed by this server.
    pub fn tools(&self) -> &[McpToolInfo] {
        &self.tools
    }

    pub fn server_name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Shut down the server connection.
    ///
    /// Pending calls fail with `ConnectionClosed`, stdin is closed, and the
    /// process is killed if it has not exited within the grace period.
    pub async fn shutdown(&self) {
        self.connection.close("host shutdown").await;
        if let Some(process) = &self.process {
            let exit = process.terminate().await;
            tracing::debug!("MCP server '{}' {exit}", self.name);
        }
        if let Some(watcher) = &self.exit_watcher {
            watcher.abort();
        }
        self.log.record(LogEvent::new(
            &self.name,
            LogKind::Connection,
            json!({"status": "shutdown"}),
        ));
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(watcher) = &self.exit_watcher {
            watcher.abort();
        }
    }
}

async fn handshake(
    connection: &McpConnection,
    timeout: Duration,
) -> Result<(ServerInfo, Vec<McpToolInfo>), McpError> {
    let server = connection.server();
    let at = |stage: HandshakeStage| {
        move |e: McpError| McpError::Handshake {
            server: server.to_string(),
            stage,
            source: Box::new(e),
        }
    };

    let init_params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "ferry",
            "version": env!("CARGO_PKG_VERSION")
        }
    });
    let init = connection
        .request("initialize", Some(init_params), timeout)
        .await
        .map_err(at(HandshakeStage::Initialize))?;
    let server_info: ServerInfo = serde_json::from_value(init)
        .map_err(|e| McpError::Protocol(format!("Failed to parse initialize result: {e}")))
        .map_err(at(HandshakeStage::Initialize))?;
    if let Some(version) = &server_info.protocol_version {
        if version != PROTOCOL_VERSION {
            tracing::warn!(
                "MCP server '{server}' speaks protocol {version}, client requested {PROTOCOL_VERSION}"
            );
        }
    }

    connection
        .notify("notifications/initialized", None)
        .await
        .map_err(at(HandshakeStage::Initialized))?;

    let tools = list_tools(connection, timeout)
        .await
        .map_err(at(HandshakeStage::ToolsList))?;

    connection.mark_ready().map_err(at(HandshakeStage::ToolsList))?;
    Ok((server_info, tools))
}

/// Fetch the whole catalog, following `nextCursor` pagination.
async fn list_tools(
    connection: &McpConnection,
    timeout: Duration,
) -> Result<Vec<McpToolInfo>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({"cursor": c}));
        let result = connection.request("tools/list", params, timeout).await?;
        let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
        })?;
        tools.extend(page.tools.iter().map(McpToolInfo::from_value));

        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) if cursor.as_ref() == Some(&next) => {
                return Err(McpError::Protocol(format!(
                    "tools/list repeated cursor {next:?}"
                )));
            }
            Some(next) => cursor = Some(next),
            None => return Ok(tools),
        }
    }
    Err(McpError::Protocol(format!(
        "tools/list did not finish within {MAX_TOOL_PAGES} pages"
    )))
}
