//! Ferry CLI: a terminal chat host that gives Claude tools from MCP servers.

mod console;

use anyhow::{Context, Result};
use clap::Parser;
use console::Command;
use ferry_api::AnthropicProvider;
use ferry_config::{CliOverrides, HostConfig};
use ferry_core::{Conversation, ConversationEvent};
use ferry_mcp::{McpManager, ServerNotification, ToolOrchestrator};
use ferry_session::{History, InteractionLog, LogFilter};
use ferry_types::{FerryError, Usage};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Number of entries the `logs` command shows.
const LOG_VIEW_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "ferry", version, about = "Chat with Claude using tools from MCP servers")]
struct Cli {
    /// Send a single prompt and print the response (non-interactive)
    #[arg(short, long)]
    print: Option<String>,

    /// Config file to use instead of ~/.ferry/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to use
    #[arg(long)]
    model: Option<String>,

    /// Maximum tokens in the response
    #[arg(long)]
    max_tokens: Option<u32>,

    /// API key (overrides ANTHROPIC_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Where to write the interaction log
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,
}

enum Turn<'a> {
    Send(&'a str),
    Retry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = HostConfig::load(CliOverrides {
        config_file: cli.config,
        api_key: cli.api_key,
        model: cli.model,
        max_tokens: cli.max_tokens,
        log_file: cli.log_file,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let provider = AnthropicProvider::new(&config.api_key, &config.api_base_url)
        .context("Failed to create API client")?;

    let mut history = History::new();
    let log = InteractionLog::open(&config.log_file, history.id(), config.max_field_bytes)
        .with_context(|| {
            format!(
                "Failed to open interaction log {}",
                config.log_file.display()
            )
        })?;

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let observer = tokio::spawn(report_notifications(notify_rx));

    let manager = McpManager::start(&config.mcp, &log, Some(notify_tx)).await;
    if let Some(summary) = manager.failure_summary() {
        eprintln!("{summary}");
    }
    let orchestrator = Arc::new(ToolOrchestrator::build(manager.clients(), log.clone()));
    for skipped in orchestrator.skipped() {
        eprintln!("Skipped {skipped}");
    }

    let mut conversation = Conversation::new(
        Arc::new(provider),
        Arc::clone(&orchestrator) as Arc<dyn ferry_types::ToolExecutor>,
        config.model.clone(),
        config.max_tokens,
        log.clone(),
    );
    conversation.set_system_prompt(
        config
            .system_prompt
            .clone()
            .unwrap_or_else(|| system_prompt(&orchestrator)),
    );

    let result = if let Some(prompt) = cli.print {
        // Print mode: single prompt, then exit
        run_turn(&conversation, &mut history, Turn::Send(&prompt))
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("{e}"))
    } else {
        repl(&conversation, &mut history, &manager, &orchestrator, &log, &config).await
    };

    // Fail anything still in flight, stop every server, then seal the log.
    manager.shutdown().await;
    observer.abort();
    log.close();

    print_usage(history.usage());
    result
}

async fn repl(
    conversation: &Conversation,
    history: &mut History,
    manager: &McpManager,
    orchestrator: &ToolOrchestrator,
    log: &InteractionLog,
    config: &HostConfig,
) -> Result<()> {
    eprintln!(
        "ferry v{} (model: {}, session: {}, {} tool(s) from {} server(s))",
        env!("CARGO_PKG_VERSION"),
        config.model,
        history.short_id(),
        orchestrator.len(),
        manager.client_count()
    );
    if let Some(path) = log.path() {
        eprintln!("Interaction log: {}", path.display());
    }
    eprintln!("Type your message, or 'help' for commands. Press Ctrl+D to exit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        io::stderr().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        };
        let Some(line) = line else {
            eprintln!();
            break;
        };
        let Some(command) = console::parse_command(&line) else {
            continue;
        };

        match command {
            Command::Quit => break,
            Command::Help => eprintln!("{}", console::help_text()),
            Command::Tools => {
                eprint!(
                    "{}",
                    console::render_tools(&manager.status(), orchestrator.catalog())
                );
            }
            Command::History => eprint!("{}", console::render_history(history)),
            Command::Logs { server } => show_logs(log, server).await,
            Command::Retry => report(run_turn(conversation, history, Turn::Retry).await),
            Command::Message(text) => {
                report(run_turn(conversation, history, Turn::Send(text)).await)
            }
        }
    }

    Ok(())
}

/// Run one turn, streaming its events to the terminal. Ctrl+C cancels it.
async fn run_turn(
    conversation: &Conversation,
    history: &mut History,
    turn: Turn<'_>,
) -> Result<String, FerryError> {
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let on_event = |event: ConversationEvent| match event {
        ConversationEvent::Text(text) => {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        }
        ConversationEvent::ToolStart { name, input, .. } => {
            let _ = writeln!(out, "  [tool: {name} {input}]");
            let _ = out.flush();
        }
        ConversationEvent::ToolEnd {
            name,
            output,
            is_error,
            ..
        } => {
            if is_error {
                let _ = writeln!(out, "  [tool {name} error: {output}]");
            } else {
                let _ = writeln!(out, "  [tool {name} done: {output}]");
            }
        }
        ConversationEvent::Usage(_) => {}
        ConversationEvent::Done => {
            let _ = writeln!(out);
        }
        ConversationEvent::Cancelled => {
            let _ = writeln!(io::stderr(), "Cancelled.");
        }
        ConversationEvent::Error(e) => {
            let _ = writeln!(io::stderr(), "Error: {e}");
            let _ = writeln!(io::stderr(), "Type 'retry' to try again.");
        }
    };

    let result = match turn {
        Turn::Send(text) => conversation.send(history, text, cancel, on_event).await,
        Turn::Retry => conversation.retry(history, cancel, on_event).await,
    };
    watcher.abort();
    result
}

/// Turn failures were already shown as events; only report what was not.
fn report(result: Result<String, FerryError>) {
    if let Err(FerryError::NothingToRetry) = result {
        eprintln!("Nothing to retry.");
    }
}

async fn show_logs(log: &InteractionLog, server: Option<&str>) {
    let filter = LogFilter {
        server: server.map(str::to_string),
        kind: None,
    };
    let entries = log.recent(&filter, LOG_VIEW_LIMIT).await;
    let summary = log.summary().await;
    match (entries, summary) {
        (Ok(entries), Ok(summary)) => eprint!("{}", console::render_logs(&entries, &summary)),
        (Err(e), _) | (_, Err(e)) => eprintln!("Failed to read interaction log: {e}"),
    }
}

/// Surface server notifications in the diagnostic log.
async fn report_notifications(mut rx: mpsc::UnboundedReceiver<ServerNotification>) {
    while let Some(ServerNotification {
        server,
        notification,
    }) = rx.recv().await
    {
        match notification.method.as_str() {
            "notifications/message" => {
                let params = notification.params.unwrap_or_default();
                tracing::info!(
                    "[{server}] {}: {}",
                    params["level"].as_str().unwrap_or("info"),
                    params["data"]
                );
            }
            "notifications/tools/list_changed" => {
                tracing::warn!(
                    "[{server}] tool list changed; the catalog is fixed for this session"
                );
            }
            method => tracing::debug!("[{server}] notification {method}"),
        }
    }
}

fn system_prompt(orchestrator: &ToolOrchestrator) -> String {
    let mut prompt = String::from(
        "You are Ferry, an assistant running in a terminal. \
         You can call tools provided by connected MCP servers.",
    );
    if orchestrator.is_empty() {
        prompt.push_str(" No tools are available in this session.");
    } else {
        prompt.push_str(" Use a tool when it can answer more reliably than you can alone.");
    }
    prompt.push_str(" Be concise and helpful.");
    prompt
}

fn print_usage(usage: &Usage) {
    eprintln!(
        "Tokens: input {}, output {}",
        usage.input_tokens, usage.output_tokens
    );
}
