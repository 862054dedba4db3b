//! Conversation history for one host session.

use chrono::{DateTime, Utc};
use ferry_types::{ContentBlock, Message, Role, ToolResultContent, Usage};
use uuid::Uuid;

/// Ordered record of everything said in a session.
///
/// The whole history is replayed to the model on every request, so entries
/// are only ever appended. The one exception is [`History::rollback`], which
/// drops what a failed turn appended after its checkpoint.
#[derive(Debug, Clone)]
pub struct History {
    id: Uuid,
    started_at: DateTime<Utc>,
    messages: Vec<Message>,
    usage: Usage,
}

/// Position in the history returned by [`History::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// A flattened, read-only view of one history item.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry<'a> {
    User(&'a str),
    Assistant(&'a str),
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a serde_json::Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a [ToolResultContent],
        is_error: bool,
    },
}

impl History {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            messages: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Short hex prefix of the session ID for display.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user_text(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user_text(text));
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.messages.len())
    }

    /// Discard everything appended after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        if checkpoint.0 < self.messages.len() {
            tracing::debug!(
                "Rolling back {} history messages",
                self.messages.len() - checkpoint.0
            );
            self.messages.truncate(checkpoint.0);
        }
    }

    /// True when the last message is a user message still waiting for a reply
    /// (as left behind by a failed turn).
    pub fn awaiting_reply(&self) -> bool {
        match self.messages.last() {
            Some(m) if m.role == Role::User => m
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::Text { .. })),
            _ => false,
        }
    }

    /// Every history item in the order it occurred.
    pub fn entries(&self) -> Vec<HistoryEntry<'_>> {
        let mut entries = Vec::new();
        for message in &self.messages {
            for block in &message.content {
                let entry = match (message.role, block) {
                    (Role::User, ContentBlock::Text { text }) => HistoryEntry::User(text),
                    (Role::Assistant, ContentBlock::Text { text }) => HistoryEntry::Assistant(text),
                    (_, ContentBlock::ToolUse { id, name, input }) => {
                        HistoryEntry::ToolUse { id, name, input }
                    }
                    (
                        _,
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        },
                    ) => HistoryEntry::ToolResult {
                        tool_use_id,
                        content,
                        is_error: is_error.unwrap_or(false),
                    },
                };
                entries.push(entry);
            }
        }
        entries
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_round(history: &mut History) {
        history.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "suggest_team".into(),
                input: serde_json::json!({"format": "vgc"}),
            }],
        });
        history.push(Message {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: vec![ToolResultContent::Text {
                    text: "Incineroar, Rillaboom".into(),
                }],
                is_error: None,
            }],
        });
    }

    #[test]
    fn entries_follow_insertion_order() {
        let mut history = History::new();
        history.push_user_text("suggest a team");
        tool_round(&mut history);
        history.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::Text {
                text: "Try Incineroar.".into(),
            }],
        });

        let entries = history.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], HistoryEntry::User("suggest a team"));
        assert!(matches!(entries[1], HistoryEntry::ToolUse { name: "suggest_team", .. }));
        assert!(matches!(
            entries[2],
            HistoryEntry::ToolResult {
                tool_use_id: "toolu_1",
                is_error: false,
                ..
            }
        ));
        assert_eq!(entries[3], HistoryEntry::Assistant("Try Incineroar."));
    }

    #[test]
    fn rollback_keeps_user_message() {
        let mut history = History::new();
        history.push_user_text("suggest a team");
        let checkpoint = history.checkpoint();
        tool_round(&mut history);
        assert_eq!(history.len(), 3);

        history.rollback(checkpoint);
        assert_eq!(history.len(), 1);
        assert!(history.awaiting_reply());
    }

    #[test]
    fn tool_results_do_not_count_as_awaiting_reply() {
        let mut history = History::new();
        assert!(!history.awaiting_reply());
        history.push_user_text("hi");
        tool_round(&mut history);
        assert!(!history.awaiting_reply());
    }

    #[test]
    fn rollback_to_later_checkpoint_is_noop() {
        let mut history = History::new();
        history.push_user_text("one");
        let later = history.checkpoint();
        history.rollback(Checkpoint(5));
        history.rollback(later);
        assert_eq!(history.len(), 1);
    }
}
