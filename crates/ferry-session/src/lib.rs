//! Conversation history and the append-only interaction log for Ferry.

pub mod error;
pub mod history;
pub mod log;

pub use error::SessionError;
pub use history::{Checkpoint, History, HistoryEntry};
pub use log::{InteractionLog, LogEntry, LogEvent, LogFilter, LogKind, LogSummary};
