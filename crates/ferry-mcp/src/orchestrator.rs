//! Bridge between the model's tool-use contract and MCP servers.
//!
//! At build time every server's raw descriptors are validated, given
//! API-safe names and indexed. At call time the sanitized name is mapped back
//! to `(server, original name)` and dispatched as `tools/call`.

use crate::client::{McpClient, McpToolContent, McpToolInfo, McpToolResult};
use crate::error::McpError;
use crate::sanitize::{NameAllocator, sanitize_tool_name};
use ferry_session::{InteractionLog, LogEvent, LogKind};
use ferry_types::{
    ImageSource, ImageSourceType, ToolDefinition, ToolError, ToolExecutor, ToolFuture, ToolOutput,
    ToolOutputContent,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One tool as offered to the model, with where it really lives.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    pub server: String,
    pub original_name: String,
}

/// The flat, deduplicated union of every connected server's tools.
pub struct ToolOrchestrator {
    entries: Vec<CatalogEntry>,
    routes: HashMap<String, (usize, Arc<McpClient>)>,
    skipped: Vec<ToolError>,
    log: InteractionLog,
}

impl ToolOrchestrator {
    /// Index the catalogs of `clients`, in order.
    ///
    /// Earlier servers (and earlier tools within a server) win name
    /// collisions; later duplicates get a numeric suffix.
    pub fn build(clients: &[Arc<McpClient>], log: InteractionLog) -> Self {
        let contributing = clients.iter().filter(|c| !c.tools().is_empty()).count();
        let mut names = NameAllocator::new();
        let mut entries = Vec::new();
        let mut routes = HashMap::new();
        let mut skipped = Vec::new();

        for client in clients {
            for tool in client.tools() {
                let input_schema = match validate_descriptor(tool) {
                    Ok(schema) => schema,
                    Err(e) => {
                        tracing::warn!("Skipping tool from '{}': {e}", client.server_name());
                        skipped.push(e);
                        continue;
                    }
                };

                let name = names.claim(&sanitize_tool_name(&tool.name));
                if name != tool.name {
                    tracing::debug!(
                        "Exposing '{}' from '{}' as '{name}'",
                        tool.name,
                        client.server_name()
                    );
                }

                let description = tool.description.as_deref().unwrap_or_default().trim();
                let description = if contributing > 1 {
                    format!("[{}] {description}", client.server_name())
                } else {
                    description.to_string()
                };

                routes.insert(name.clone(), (entries.len(), Arc::clone(client)));
                entries.push(CatalogEntry {
                    definition: ToolDefinition {
                        name,
                        description,
                        input_schema,
                    },
                    server: client.server_name().to_string(),
                    original_name: tool.name.clone(),
                });
            }
        }

        Self {
            entries,
            routes,
            skipped,
            log,
        }
    }

    /// Catalog in the order it is offered to the model.
    pub fn catalog(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Descriptors rejected at build time.
    pub fn skipped(&self) -> &[ToolError] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(server, original name)` behind a sanitized name.
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        self.routes.get(name).map(|(index, _)| {
            let entry = &self.entries[*index];
            (entry.server.as_str(), entry.original_name.as_str())
        })
    }

    /// Run the tool the model called `name`.
    ///
    /// RPC errors, timeouts and lost connections come back as `ToolError`s
    /// for the caller to hand to the model; none of them are fatal.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let Some((index, client)) = self.routes.get(name) else {
            tracing::warn!("Model requested unknown tool '{name}'");
            self.log.record(LogEvent::new(
                "",
                LogKind::Error,
                json!({"tool": name, "error": "unknown tool"}),
            ));
            return Err(ToolError::UnknownTool {
                name: name.to_string(),
            });
        };
        let entry = &self.entries[*index];
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let started = Instant::now();
        self.log.record(LogEvent::new(
            &entry.server,
            LogKind::ToolCall,
            json!({
                "tool": name,
                "original_name": entry.original_name,
                "arguments": arguments,
            }),
        ));

        let outcome = client
            .call_tool(&entry.original_name, arguments)
            .await
            .map(into_output)
            .map_err(|e| into_tool_error(e, name, &entry.server, &entry.original_name));

        let data = match &outcome {
            Ok(output) => json!({
                "tool": name,
                "is_error": output.is_error,
                "content": output.joined_text(),
            }),
            Err(e) => json!({"tool": name, "is_error": true, "error": e.to_string()}),
        };
        self.log.record(
            LogEvent::new(&entry.server, LogKind::ToolResult, data).with_duration(started.elapsed()),
        );
        outcome
    }
}

impl ToolExecutor for ToolOrchestrator {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    fn execute(&self, name: &str, input: serde_json::Value) -> ToolFuture<'_> {
        let name = name.to_string();
        Box::pin(async move { self.invoke(&name, input).await })
    }
}

fn default_schema() -> serde_json::Value {
    json!({"type": "object", "properties": {}})
}

/// Check a raw descriptor's shape and return the schema to advertise.
fn validate_descriptor(tool: &McpToolInfo) -> Result<serde_json::Value, ToolError> {
    if tool.name.trim().is_empty() {
        return Err(ToolError::InvalidDescriptor {
            name: tool.name.clone(),
            reason: "empty name".to_string(),
        });
    }
    match &tool.input_schema {
        None | Some(serde_json::Value::Null) => Ok(default_schema()),
        Some(schema) if schema.is_object() => Ok(schema.clone()),
        Some(_) => Err(ToolError::InvalidDescriptor {
            name: tool.name.clone(),
            reason: "inputSchema is not an object".to_string(),
        }),
    }
}

fn into_output(result: McpToolResult) -> ToolOutput {
    let content = result
        .content
        .into_iter()
        .map(|item| match item {
            McpToolContent::Text { text } => ToolOutputContent::Text { text },
            McpToolContent::Image { data, mime_type } => ToolOutputContent::Image {
                source: ImageSource {
                    source_type: ImageSourceType::Base64,
                    media_type: mime_type,
                    data,
                },
            },
            McpToolContent::Resource {
                text: Some(text), ..
            } => ToolOutputContent::Text { text },
            McpToolContent::Resource { uri, mime_type, .. } => ToolOutputContent::Text {
                text: json!({"type": "resource", "uri": uri, "mimeType": mime_type}).to_string(),
            },
            McpToolContent::Other(value) => ToolOutputContent::Text {
                text: value.to_string(),
            },
        })
        .collect();
    ToolOutput {
        content,
        is_error: result.is_error,
    }
}

fn into_tool_error(error: McpError, name: &str, server: &str, original: &str) -> ToolError {
    match error {
        McpError::JsonRpc { code, message, .. } => ToolError::Rpc {
            server: server.to_string(),
            tool: original.to_string(),
            code,
            message,
        },
        McpError::Timeout { timeout_ms, .. } => ToolError::Timeout {
            tool: name.to_string(),
            timeout_ms,
        },
        McpError::ConnectionClosed { reason, .. } => ToolError::Unavailable {
            server: server.to_string(),
            reason,
        },
        McpError::NotReady { state, .. } => ToolError::Unavailable {
            server: server.to_string(),
            reason: format!("connection is {state}"),
        },
        other => ToolError::ExecutionFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, schema: Option<serde_json::Value>) -> McpToolInfo {
        McpToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: schema,
        }
    }

    #[test]
    fn missing_schema_gets_default() {
        let schema = validate_descriptor(&info("list", None)).unwrap();
        assert_eq!(schema, default_schema());
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        assert!(matches!(
            validate_descriptor(&info("  ", None)),
            Err(ToolError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            validate_descriptor(&info("x", Some(json!(["not", "object"])))),
            Err(ToolError::InvalidDescriptor { reason, .. }) if reason.contains("inputSchema")
        ));
    }

    #[test]
    fn result_content_converts() {
        let output = into_output(McpToolResult {
            content: vec![
                McpToolContent::Text { text: "a".into() },
                McpToolContent::Resource {
                    uri: Some("file:///x".into()),
                    text: None,
                    mime_type: None,
                },
                McpToolContent::Other(json!({"type": "audio"})),
            ],
            is_error: true,
        });
        assert!(output.is_error);
        let text = output.joined_text();
        assert!(text.starts_with("a\n"));
        assert!(text.contains("file:///x"));
        assert!(text.contains("audio"));
    }

    #[test]
    fn rpc_errors_keep_original_name() {
        let err = into_tool_error(
            McpError::JsonRpc {
                server: "pokevgc".into(),
                code: -32602,
                message: "bad format".into(),
            },
            "suggest_team",
            "pokevgc",
            "suggest team",
        );
        match err {
            ToolError::Rpc { tool, code, .. } => {
                assert_eq!(tool, "suggest team");
                assert_eq!(code, -32602);
            }
            other => panic!("Expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn closed_connection_is_unavailable() {
        let err = into_tool_error(
            McpError::ConnectionClosed {
                server: "s".into(),
                reason: "server process exited".into(),
            },
            "t",
            "s",
            "t",
        );
        assert!(matches!(err, ToolError::Unavailable { .. }));
    }
}
