//! Child process supervision for stdio MCP servers.
//!
//! The supervisor owns the child for its whole life. The child's stdout and
//! stdin are handed to the connection; its stderr is forwarded line by line to
//! tracing and the interaction log and never parsed as protocol data.

use crate::config::McpServerConfig;
use crate::error::McpError;
use ferry_session::{InteractionLog, LogEvent, LogKind};
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment forced on every child so its output is neither block-buffered
/// nor re-encoded.
const FORCED_ENV: &[(&str, &str)] = &[("PYTHONUNBUFFERED", "1"), ("PYTHONIOENCODING", "utf-8")];

/// Upper bound on waiting for the stderr forwarder after the child exits.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// A running MCP server process.
pub struct ServerProcess {
    server: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    shutdown: CancellationToken,
    exit_rx: watch::Receiver<Option<String>>,
    supervisor: JoinHandle<()>,
}

impl ServerProcess {
    /// Spawn the configured command with piped stdio.
    ///
    /// `grace` bounds how long [`terminate`](Self::terminate) waits for a
    /// voluntary exit before killing the child.
    pub fn launch(
        server: &str,
        config: &McpServerConfig,
        grace: Duration,
        log: &InteractionLog,
    ) -> Result<Self, McpError> {
        let spawn_failed = |source| McpError::SpawnFailed {
            server: server.to_string(),
            source,
        };

        if let Some(cwd) = &config.cwd {
            if !cwd.is_dir() {
                return Err(spawn_failed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", cwd.display()),
                )));
            }
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .envs(FORCED_ENV.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(spawn_failed)?;
        let pid = child.id();
        tracing::info!("Spawned MCP server '{server}' (pid {pid:?}): {}", config.command);
        log.record(LogEvent::new(
            server,
            LogKind::Connection,
            json!({
                "status": "spawned",
                "command": config.command,
                "args": config.args,
                "pid": pid,
            }),
        ));

        let missing = |stream: &str| McpError::Protocol(format!("child {stream} was not piped"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let forwarder = tokio::spawn(forward_stderr(server.to_string(), stderr, log.clone()));

        let shutdown = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(
            server.to_string(),
            child,
            forwarder,
            shutdown.clone(),
            grace,
            exit_tx,
            log.clone(),
        ));

        Ok(Self {
            server: server.to_string(),
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            shutdown,
            exit_rx,
            supervisor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the child's stdin and stdout to the caller. Succeeds once.
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout), McpError> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            _ => Err(McpError::Protocol(format!(
                "stdio of '{}' was already taken",
                self.server
            ))),
        }
    }

    /// A watch that holds the exit description once the child has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit_rx.clone()
    }

    /// Whether the child has exited.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the child to exit and return a description of how it ended.
    pub async fn wait(&self) -> String {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => "supervisor stopped".to_string(),
        }
    }

    /// Ask the child to exit, kill it after the grace period, and wait.
    ///
    /// The caller is expected to have closed the child's stdin first; for a
    /// stdio MCP server that is the request to shut down.
    pub async fn terminate(&self) -> String {
        self.shutdown.cancel();
        self.wait().await
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.supervisor.is_finished() {
            return;
        }
        // Dropping the supervisor's child handle kills the process.
        self.supervisor.abort();
    }
}

async fn supervise(
    server: String,
    mut child: Child,
    forwarder: JoinHandle<()>,
    shutdown: CancellationToken,
    grace: Duration,
    exit_tx: watch::Sender<Option<String>>,
    log: InteractionLog,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = shutdown.cancelled() => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(
                        "MCP server '{server}' did not exit within {}s, killing it",
                        grace.as_secs_f32()
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill MCP server '{server}': {e}");
                    }
                    child.wait().await
                }
            }
        }
    };

    let description = match status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("failed to wait for process: {e}"),
    };

    if tokio::time::timeout(STDERR_DRAIN, forwarder).await.is_err() {
        tracing::debug!("Stderr of '{server}' still open after exit");
    }

    tracing::info!("MCP server '{server}' {description}");
    log.record(LogEvent::new(
        &server,
        LogKind::Connection,
        json!({"status": "exited", "reason": description}),
    ));
    exit_tx.send_replace(Some(description));
}

async fn forward_stderr(server: String, stderr: impl AsyncRead + Unpin, log: InteractionLog) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!("[{server} stderr] {line}");
                log.record(LogEvent::new(&server, LogKind::Stderr, json!(line)));
            }
            Err(e) => {
                tracing::debug!("Stopped reading stderr of '{server}': {e}");
                break;
            }
        }
    }
}
