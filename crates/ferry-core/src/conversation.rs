//! The conversation loop that alternates between the model and tool calls.

use ferry_session::{History, InteractionLog, LogEvent, LogKind};
use ferry_types::provider::Provider;
use ferry_types::{
    ApiError, ContentBlock, CreateMessageRequest, CreateMessageResponse, FerryError, Message,
    Role, StopReason, ToolExecutor, ToolOutput, Usage,
};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Maximum number of tool-use rounds in a single turn.
pub const MAX_TOOL_LOOPS: usize = 50;

/// Events emitted while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Assistant text from one model response.
    Text(String),
    /// A tool call is about to be dispatched.
    ToolStart {
        id: String,
        name: String,
        input: String,
    },
    /// A tool call finished (successfully or not).
    ToolEnd {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// Usage reported by one model response.
    Usage(Usage),
    /// The model answered without asking for more tools.
    Done,
    /// The turn was cancelled (e.g. Ctrl+C).
    Cancelled,
    /// The turn failed; history was rolled back to the user message.
    Error(String),
}

/// Drives turns against a provider and a tool executor.
pub struct Conversation {
    provider: Arc<dyn Provider>,
    tools: Arc<dyn ToolExecutor>,
    model: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    log: InteractionLog,
}

impl Conversation {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolExecutor>,
        model: impl Into<String>,
        max_tokens: u32,
        log: InteractionLog,
    ) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            max_tokens,
            system_prompt: None,
            log,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Append `text` as a user message and run the turn to completion.
    ///
    /// Returns the final assistant text. On failure, everything after the
    /// user message is discarded so the turn can be retried.
    pub async fn send<F>(
        &self,
        history: &mut History,
        text: &str,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<String, FerryError>
    where
        F: FnMut(ConversationEvent),
    {
        history.push_user_text(text);
        self.run_from_checkpoint(history, cancel, on_event).await
    }

    /// Re-run a failed turn from the user message it left behind.
    pub async fn retry<F>(
        &self,
        history: &mut History,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<String, FerryError>
    where
        F: FnMut(ConversationEvent),
    {
        if !history.awaiting_reply() {
            return Err(FerryError::NothingToRetry);
        }
        self.run_from_checkpoint(history, cancel, on_event).await
    }

    async fn run_from_checkpoint<F>(
        &self,
        history: &mut History,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<String, FerryError>
    where
        F: FnMut(ConversationEvent),
    {
        let checkpoint = history.checkpoint();
        let result = self.run_turn(history, &cancel, &mut on_event).await;
        if let Err(e) = &result {
            history.rollback(checkpoint);
            match e {
                FerryError::Cancelled => on_event(ConversationEvent::Cancelled),
                other => {
                    tracing::warn!("Turn failed: {other}");
                    on_event(ConversationEvent::Error(other.to_string()));
                }
            }
        }
        result
    }

    async fn run_turn<F>(
        &self,
        history: &mut History,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<String, FerryError>
    where
        F: FnMut(ConversationEvent),
    {
        let definitions = self.tools.definitions();
        let tools = if definitions.is_empty() {
            None
        } else {
            Some(definitions)
        };

        for round in 0..MAX_TOOL_LOOPS {
            let request = CreateMessageRequest {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                messages: history.messages().to_vec(),
                system: self.system_prompt.clone(),
                tools: tools.clone(),
            };

            let response = self.call_model(&request, round, cancel).await?;
            history.add_usage(&response.usage);
            on_event(ConversationEvent::Usage(response.usage.clone()));

            let message = validate_response(response)?;
            let text = message.text();
            let tool_uses = message.tool_uses();
            history.push(message);

            if !text.is_empty() {
                on_event(ConversationEvent::Text(text.clone()));
            }

            if tool_uses.is_empty() {
                on_event(ConversationEvent::Done);
                return Ok(text);
            }

            for (id, name, input) in &tool_uses {
                on_event(ConversationEvent::ToolStart {
                    id: id.clone(),
                    name: name.clone(),
                    input: truncate_for_display(&input.to_string(), 200),
                });
            }

            let calls = tool_uses
                .iter()
                .map(|(_, name, input)| self.tools.execute(name, input.clone()));
            let outputs = tokio::select! {
                _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                outputs = join_all(calls) => outputs,
            };

            let mut results = Vec::with_capacity(outputs.len());
            for ((id, name, _), output) in tool_uses.into_iter().zip(outputs) {
                let output = output.unwrap_or_else(|e| {
                    tracing::debug!("Tool '{name}' failed: {e}");
                    ToolOutput::error(e.to_string())
                });
                on_event(ConversationEvent::ToolEnd {
                    id: id.clone(),
                    name,
                    output: truncate_for_display(&output.joined_text(), 200),
                    is_error: output.is_error,
                });
                let is_error = output.is_error.then_some(true);
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: output.into_result_content(),
                    is_error,
                });
            }

            history.push(Message {
                role: Role::User,
                content: results,
            });
        }

        Err(FerryError::ToolLoopLimit {
            limit: MAX_TOOL_LOOPS,
        })
    }

    async fn call_model(
        &self,
        request: &CreateMessageRequest,
        round: usize,
        cancel: &CancellationToken,
    ) -> Result<CreateMessageResponse, FerryError> {
        self.log.record(LogEvent::new(
            self.provider.name(),
            LogKind::LlmRequest,
            json!({
                "model": request.model,
                "round": round,
                "messages": request.messages.len(),
                "tools": request.tools.as_ref().map_or(0, Vec::len),
                "last_message": request.messages.last(),
            }),
        ));

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            result = self.provider.create_message(request) => result,
        };

        let data = match &result {
            Ok(response) => json!({
                "id": response.id,
                "stop_reason": response.stop_reason,
                "usage": response.usage,
                "content": response.content,
            }),
            Err(e) => json!({"error": e.to_string()}),
        };
        let kind = if result.is_ok() {
            LogKind::LlmResponse
        } else {
            LogKind::Error
        };
        self.log.record(
            LogEvent::new(self.provider.name(), kind, data).with_duration(started.elapsed()),
        );

        result.map_err(FerryError::Api)
    }
}

/// Turn a model response into the assistant message to record, rejecting
/// shapes the loop cannot act on.
fn validate_response(response: CreateMessageResponse) -> Result<Message, FerryError> {
    let malformed = |reason: &str| FerryError::Api(ApiError::MalformedResponse(reason.into()));

    if response.role != Role::Assistant {
        return Err(malformed("response role is not assistant"));
    }
    let mut has_tool_use = false;
    for block in &response.content {
        match block {
            ContentBlock::ToolUse { id, name, .. } => {
                if id.is_empty() || name.is_empty() {
                    return Err(malformed("tool_use block without id or name"));
                }
                has_tool_use = true;
            }
            ContentBlock::ToolResult { .. } => {
                return Err(malformed("tool_result block in assistant response"));
            }
            ContentBlock::Text { .. } => {}
        }
    }
    if response.stop_reason == Some(StopReason::ToolUse) && !has_tool_use {
        return Err(malformed("stop_reason is tool_use but no tool_use block"));
    }
    if response.content.is_empty() {
        return Err(malformed("empty response content"));
    }

    Ok(Message {
        role: Role::Assistant,
        content: response.content,
    })
}

fn truncate_for_display(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", ferry_types::truncate_str(s, max_len))
    }
}
