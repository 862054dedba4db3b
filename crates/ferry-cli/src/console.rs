//! Console commands and the text views they print.

use ferry_mcp::{CatalogEntry, ServerStatus};
use ferry_session::{History, HistoryEntry, LogEntry, LogSummary};
use ferry_types::ToolResultContent;
use std::fmt::Write;

/// What one line of console input asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Tools,
    History,
    Logs { server: Option<&'a str> },
    Retry,
    Quit,
    Message(&'a str),
}

/// Parse a line of input. Blank lines yield `None`.
///
/// Command words are case-insensitive and may carry a leading `/`;
/// anything else is sent to the model as-is.
pub fn parse_command(input: &str) -> Option<Command<'_>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let (word, rest) = match input.split_once(char::is_whitespace) {
        Some((w, r)) => (w, Some(r.trim()).filter(|r| !r.is_empty())),
        None => (input, None),
    };
    let word = word.strip_prefix('/').unwrap_or(word).to_ascii_lowercase();

    let command = match (word.as_str(), rest) {
        ("help", None) => Command::Help,
        ("tools", None) => Command::Tools,
        ("history", None) => Command::History,
        ("logs", None) => Command::Logs { server: None },
        ("logs", Some(server)) if !server.contains(char::is_whitespace) => Command::Logs {
            server: Some(server),
        },
        ("retry", None) => Command::Retry,
        ("quit" | "exit", None) => Command::Quit,
        _ => Command::Message(input),
    };
    Some(command)
}

pub fn help_text() -> &'static str {
    "Commands:\n  \
     help           Show this help\n  \
     tools          List the tools offered to the model\n  \
     history        Show the conversation so far\n  \
     logs [server]  Show recent MCP interactions\n  \
     retry          Re-run the last failed turn\n  \
     quit           Exit (also: exit, Ctrl+D)\n\n\
     Press Ctrl+C to cancel a running turn."
}

pub fn render_tools(servers: &[ServerStatus], catalog: &[CatalogEntry]) -> String {
    let mut out = String::new();
    if servers.is_empty() {
        out.push_str("No MCP servers connected.\n");
        return out;
    }
    for server in servers {
        let _ = write!(out, "{} [{}]", server.name, server.state);
        if let Some(info) = &server.server_info {
            let _ = write!(out, " {info}");
        }
        let _ = writeln!(out, " - {} tool(s)", server.tool_count);
        if let Some(description) = &server.description {
            let _ = writeln!(out, "  {description}");
        }
        for entry in catalog.iter().filter(|e| e.server == server.name) {
            let _ = write!(out, "  - {}", entry.definition.name);
            if entry.definition.name != entry.original_name {
                let _ = write!(out, " (\"{}\")", entry.original_name);
            }
            let summary = first_line(&entry.definition.description);
            if !summary.is_empty() {
                let _ = write!(out, ": {summary}");
            }
            out.push('\n');
        }
    }
    out
}

pub fn render_history(history: &History) -> String {
    if history.is_empty() {
        return "No messages yet.\n".to_string();
    }
    let mut out = String::new();
    for entry in history.entries() {
        match entry {
            HistoryEntry::User(text) => {
                let _ = writeln!(out, "You: {text}");
            }
            HistoryEntry::Assistant(text) => {
                let _ = writeln!(out, "Claude: {text}");
            }
            HistoryEntry::ToolUse { name, input, .. } => {
                let _ = writeln!(out, "  [tool call: {name} {input}]");
            }
            HistoryEntry::ToolResult {
                content, is_error, ..
            } => {
                let label = if is_error { "tool error" } else { "tool result" };
                let text = clip(&result_text(content), 200);
                let _ = writeln!(out, "  [{label}: {text}]");
            }
        }
    }
    let usage = history.usage();
    let _ = writeln!(
        out,
        "({} messages, {} input / {} output tokens)",
        history.len(),
        usage.input_tokens,
        usage.output_tokens
    );
    out
}

pub fn render_logs(entries: &[LogEntry], summary: &LogSummary) -> String {
    let mut out = String::new();
    let counts: Vec<String> = summary
        .by_kind
        .iter()
        .map(|(kind, n)| format!("{}: {n}", kind.as_str()))
        .collect();
    let _ = writeln!(
        out,
        "Interaction log: {} entries ({})",
        summary.total,
        counts.join(", ")
    );
    if entries.is_empty() {
        out.push_str("No matching entries.\n");
        return out;
    }
    for entry in entries {
        let _ = write!(
            out,
            "{} [{}] {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            if entry.server.is_empty() { "-" } else { entry.server.as_str() },
            entry.kind.as_str()
        );
        if let Some(id) = entry.id {
            let _ = write!(out, " #{id}");
        }
        if let Some(ms) = entry.duration_ms {
            let _ = write!(out, " ({ms}ms)");
        }
        let _ = writeln!(out, " {}", clip(&entry.data.to_string(), 160));
    }
    out
}

fn result_text(content: &[ToolResultContent]) -> String {
    content
        .iter()
        .map(|c| match c {
            ToolResultContent::Text { text } => text.as_str(),
            ToolResultContent::Image { .. } => "[image]",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default().trim()
}

fn clip(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", ferry_types::truncate_str(s, max_len))
    }
}
