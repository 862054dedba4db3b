//! Append-only interaction log.
//!
//! Every protocol event (RPC requests, responses, notifications, server
//! stderr, tool calls, LLM round trips, errors) is written as one JSON
//! object per line. The log is opened once per session and handed to each
//! component as a cheap clone; it is independent of console verbosity.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Default byte budget for a single string field in `data`.
pub const DEFAULT_MAX_FIELD_BYTES: usize = 1000;

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Kind of event recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Connection,
    Request,
    Response,
    Notification,
    Error,
    Stderr,
    ToolCall,
    ToolResult,
    LlmRequest,
    LlmResponse,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Error => "error",
            Self::Stderr => "stderr",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::LlmRequest => "llm_request",
            Self::LlmResponse => "llm_response",
        }
    }
}

/// One line of the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub session: Uuid,
    pub server: String,
    pub kind: LogKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// An event about to be recorded. Timestamp and session are filled in by the log.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub server: String,
    pub kind: LogKind,
    pub id: Option<u64>,
    pub duration_ms: Option<u64>,
    pub data: serde_json::Value,
}

impl LogEvent {
    pub fn new(server: impl Into<String>, kind: LogKind, data: serde_json::Value) -> Self {
        Self {
            server: server.into(),
            kind,
            id: None,
            duration_ms: None,
            data,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }
}

/// Filter for reading entries back.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub server: Option<String>,
    pub kind: Option<LogKind>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.server.as_deref().is_none_or(|s| s == entry.server)
            && self.kind.is_none_or(|k| k == entry.kind)
    }
}

/// Counts over the entries in the log file.
#[derive(Debug, Clone, Default)]
pub struct LogSummary {
    pub total: usize,
    pub by_kind: BTreeMap<LogKind, usize>,
    pub servers: BTreeSet<String>,
}

/// Handle to the session's interaction log.
#[derive(Clone)]
pub struct InteractionLog {
    inner: Arc<Inner>,
}

struct Inner {
    session: Uuid,
    path: Option<PathBuf>,
    max_field_bytes: usize,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl InteractionLog {
    /// Open (or create) the log file in append mode.
    pub fn open(
        path: impl Into<PathBuf>,
        session: Uuid,
        max_field_bytes: usize,
    ) -> Result<Self, SessionError> {
        let path = path.into();
        let open_err = |source| SessionError::OpenLog {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        Ok(Self {
            inner: Arc::new(Inner {
                session,
                path: Some(path),
                max_field_bytes,
                writer: Mutex::new(Some(BufWriter::new(file))),
            }),
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Uuid::nil(),
                path: None,
                max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
                writer: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session(&self) -> Uuid {
        self.inner.session
    }

    /// Append one event. Events recorded after [`close`](Self::close) are dropped.
    pub fn record(&self, event: LogEvent) {
        let mut guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            session: self.inner.session,
            server: event.server,
            kind: event.kind,
            id: event.id,
            duration_ms: event.duration_ms,
            data: clip_value(event.data, self.inner.max_field_bytes),
        };

        let result = serde_json::to_writer(&mut *writer, &entry)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            tracing::warn!("Failed to write interaction log entry: {e}");
        }
    }

    /// Flush and close the file.
    pub fn close(&self) {
        let mut guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush interaction log: {e}");
            }
        }
    }

    /// The most recent `limit` entries matching `filter`, oldest first.
    ///
    /// Lines that fail to parse are skipped.
    pub async fn recent(
        &self,
        filter: &LogFilter,
        limit: usize,
    ) -> Result<Vec<LogEntry>, SessionError> {
        let mut entries: Vec<LogEntry> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    /// Per-kind counts over the whole file.
    pub async fn summary(&self) -> Result<LogSummary, SessionError> {
        let mut summary = LogSummary::default();
        for entry in self.read_all().await? {
            summary.total += 1;
            *summary.by_kind.entry(entry.kind).or_default() += 1;
            summary.servers.insert(entry.server);
        }
        Ok(summary)
    }

    async fn read_all(&self) -> Result<Vec<LogEntry>, SessionError> {
        let Some(path) = self.path() else {
            return Ok(Vec::new());
        };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(data
            .lines()
            .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
            .collect())
    }
}

/// Cut every string longer than `max_bytes` inside `value`.
fn clip_value(value: serde_json::Value, max_bytes: usize) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(mut s) if s.len() > max_bytes => {
            ferry_types::truncate_string(&mut s, max_bytes);
            s.push_str(TRUNCATION_MARKER);
            Value::String(s)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| clip_value(v, max_bytes))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, clip_value(v, max_bytes)))
                .collect(),
        ),
        other => other,
    }
}
