//! Tool output and the executor seam between the conversation loop and
//! whatever actually runs tools.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::{ImageSource, ToolDefinition, ToolError, ToolResultContent};

/// Result of executing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output content blocks.
    pub content: Vec<ToolOutputContent>,
    /// Whether the tool execution resulted in an error.
    pub is_error: bool,
}

/// A single piece of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutputContent {
    Text { text: String },
    Image { source: ImageSource },
}

impl ToolOutput {
    /// Create a successful text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolOutputContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Create an error text output.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolOutputContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// All text content joined by newlines.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolOutputContent::Text { text } => Some(text.as_str()),
                ToolOutputContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Convert into the content of a `tool_result` block.
    pub fn into_result_content(self) -> Vec<ToolResultContent> {
        self.content
            .into_iter()
            .map(|c| match c {
                ToolOutputContent::Text { text } => ToolResultContent::Text { text },
                ToolOutputContent::Image { source } => ToolResultContent::Image { source },
            })
            .collect()
    }
}

/// Boxed future returned by [`ToolExecutor::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// Something that can advertise a tool catalog and run calls against it.
///
/// The conversation loop only sees this trait; the MCP orchestrator is the
/// production implementation.
pub trait ToolExecutor: Send + Sync {
    /// Tool definitions to send with every LLM request, in a stable order.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run the tool the model named (with its LLM-facing name).
    fn execute(&self, name: &str, input: serde_json::Value) -> ToolFuture<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_text_skips_images() {
        let output = ToolOutput {
            content: vec![
                ToolOutputContent::Text { text: "a".into() },
                ToolOutputContent::Image {
                    source: ImageSource {
                        source_type: crate::ImageSourceType::Base64,
                        media_type: "image/png".into(),
                        data: "AAAA".into(),
                    },
                },
                ToolOutputContent::Text { text: "b".into() },
            ],
            is_error: false,
        };
        assert_eq!(output.joined_text(), "a\nb");
        assert_eq!(output.into_result_content().len(), 3);
    }

    #[test]
    fn error_output_is_flagged() {
        let output = ToolOutput::error("boom");
        assert!(output.is_error);
        assert_eq!(output.joined_text(), "boom");
    }
}
