//! One JSON-RPC connection over a framed byte stream.
//!
//! A writer task drains an mpsc channel into the [`FrameWriter`]; a reader
//! task pulls frames off the [`FrameReader`] and resolves pending requests by
//! id. Each pending request owns a oneshot sender, so whichever side removes
//! it from the map first (the reader with a response, the caller on timeout
//! or drop, or `close`) is the only one that can resolve it.

use crate::error::McpError;
use crate::framing::{FrameReader, FrameWriter};
use crate::jsonrpc::{
    IncomingMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, response_id,
};
use crate::state::{ConnectionState, StateCell};
use ferry_session::{InteractionLog, LogEvent, LogKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A notification received from a server, tagged with the server's name.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    pub server: String,
    pub notification: JsonRpcNotification,
}

/// Where incoming notifications are forwarded, if anywhere.
pub type NotificationSender = mpsc::UnboundedSender<ServerNotification>;

type Outcome = Result<JsonRpcResponse, McpError>;

struct Pending {
    slot: oneshot::Sender<Outcome>,
    method: String,
    sent_at: Instant,
}

/// State shared between callers and the background tasks.
struct Shared {
    server: String,
    pending: Mutex<HashMap<u64, Pending>>,
    state: StateCell,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    log: InteractionLog,
    observer: Option<NotificationSender>,
}

impl Shared {
    /// Never held across an await.
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> McpError {
        let reason = self
            .close_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        McpError::ConnectionClosed {
            server: self.server.clone(),
            reason,
        }
    }

    /// Move to `Closed` and fail every pending request. Later calls are no-ops.
    async fn close(&self, reason: String) {
        if !self.state.transition(ConnectionState::Closed) {
            return;
        }
        *self
            .close_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.clone());
        self.closed.cancel();

        // State is `Closed` before the lock is taken, so nothing can be
        // inserted after this drain.
        let drained: Vec<(u64, Pending)> = self.pending().drain().collect();
        tracing::info!(
            "Connection to '{}' closed ({reason}); failing {} pending requests",
            self.server,
            drained.len()
        );
        self.log.record(LogEvent::new(
            &self.server,
            LogKind::Connection,
            json!({"status": "closed", "reason": reason, "pending": drained.len()}),
        ));
        for (_, pending) in drained {
            let _ = pending.slot.send(Err(self.closed_error()));
        }
    }

    fn dispatch(&self, body: &str, write_tx: &mpsc::Sender<String>) {
        let message = match IncomingMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                self.reject_malformed(body, e);
                return;
            }
        };

        match message {
            IncomingMessage::Response(response) => {
                let id = response.id;
                let Some(pending) = self.pending().remove(&id) else {
                    tracing::warn!(
                        "Discarding response from '{}' for unknown or expired request id {id}",
                        self.server
                    );
                    self.log.record(
                        LogEvent::new(
                            &self.server,
                            LogKind::Error,
                            json!({"anomaly": "unmatched response", "body": body}),
                        )
                        .with_id(id),
                    );
                    return;
                };
                tracing::debug!("<- '{}' response {id} ({})", self.server, pending.method);
                self.log.record(
                    LogEvent::new(
                        &self.server,
                        LogKind::Response,
                        json!({
                            "method": pending.method,
                            "result": response.result,
                            "error": response.error,
                        }),
                    )
                    .with_id(id)
                    .with_duration(pending.sent_at.elapsed()),
                );
                let _ = pending.slot.send(Ok(response));
            }
            IncomingMessage::Notification(notification) => {
                tracing::debug!("<- '{}' notification {}", self.server, notification.method);
                self.log.record(LogEvent::new(
                    &self.server,
                    LogKind::Notification,
                    json!({
                        "direction": "incoming",
                        "method": notification.method,
                        "params": notification.params,
                    }),
                ));
                if let Some(observer) = &self.observer {
                    let _ = observer.send(ServerNotification {
                        server: self.server.clone(),
                        notification,
                    });
                }
            }
            IncomingMessage::Request { id, method, params } => {
                self.log.record(LogEvent::new(
                    &self.server,
                    LogKind::Request,
                    json!({"direction": "incoming", "method": method, "params": params}),
                ));
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, json!({}))
                } else {
                    tracing::debug!("'{}' sent unsupported request {method}", self.server);
                    JsonRpcReply::error(
                        id,
                        METHOD_NOT_FOUND,
                        format!("Method not found: {method}"),
                    )
                };
                match serde_json::to_string(&reply) {
                    // The reader must never wait on the writer.
                    Ok(body) => match write_tx.try_send(body) {
                        Ok(()) | Err(TrySendError::Closed(_)) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!(
                                "Dropping reply to '{}' request {method}: write queue full",
                                self.server
                            );
                            self.log.record(LogEvent::new(
                                &self.server,
                                LogKind::Error,
                                json!({"anomaly": "reply dropped", "method": method}),
                            ));
                        }
                    },
                    Err(e) => tracing::warn!("Failed to serialize reply: {e}"),
                }
            }
        }
    }

    /// A body that could not be classified. If it still names one of our
    /// pending ids, that request fails now instead of waiting out its timeout.
    fn reject_malformed(&self, body: &str, reason: String) {
        let pending = response_id(body).and_then(|id| Some((id, self.pending().remove(&id)?)));
        let Some((id, pending)) = pending else {
            tracing::warn!("Ignoring message from '{}': {reason}", self.server);
            self.log.record(LogEvent::new(
                &self.server,
                LogKind::Error,
                json!({"anomaly": reason, "body": body}),
            ));
            return;
        };
        tracing::warn!(
            "Malformed response from '{}' to request {id} ({}): {reason}",
            self.server,
            pending.method
        );
        self.log.record(
            LogEvent::new(
                &self.server,
                LogKind::Error,
                json!({"method": pending.method, "anomaly": reason, "body": body}),
            )
            .with_id(id)
            .with_duration(pending.sent_at.elapsed()),
        );
        let _ = pending.slot.send(Err(McpError::Protocol(format!(
            "malformed {} response from '{}': {reason}",
            pending.method, self.server
        ))));
    }
}

/// Removes a request's pending entry when its caller goes away, however that
/// happens. Entries already claimed by the reader or `close` are gone, so the
/// removal is then a no-op.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(pending) = self.shared.pending().remove(&self.id) else {
            return;
        };
        tracing::debug!(
            "Request {} ({}) to '{}' abandoned by its caller",
            self.id,
            pending.method,
            self.shared.server
        );
        self.shared.log.record(
            LogEvent::new(
                &self.shared.server,
                LogKind::Error,
                json!({"method": pending.method, "error": "cancelled"}),
            )
            .with_id(self.id)
            .with_duration(pending.sent_at.elapsed()),
        );
    }
}

/// A live connection to one MCP server.
pub struct McpConnection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    write_tx: mpsc::Sender<String>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl McpConnection {
    /// Bind a connection to an already-running server's streams and start the
    /// background tasks.
    ///
    /// `state` is expected to be `Starting`; it moves to `Handshaking` here.
    pub fn attach<R, W>(
        server: &str,
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        state: StateCell,
        log: InteractionLog,
        observer: Option<NotificationSender>,
    ) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !state.transition(ConnectionState::Handshaking) {
            tracing::warn!(
                "Attaching '{server}' from unexpected state {}",
                state.get()
            );
        }

        let shared = Arc::new(Shared {
            server: server.to_string(),
            pending: Mutex::new(HashMap::new()),
            state,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            log,
            observer,
        });

        let (write_tx, write_rx) = mpsc::channel::<String>(64);
        let writer_handle = tokio::spawn(write_loop(Arc::clone(&shared), writer, write_rx));
        let reader_handle = tokio::spawn(read_loop(Arc::clone(&shared), reader, write_tx.clone()));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            write_tx,
            reader_handle,
            writer_handle,
        }
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Mark the handshake complete. Fails if the connection closed meanwhile.
    pub fn mark_ready(&self) -> Result<(), McpError> {
        if self.shared.state.transition(ConnectionState::Ready) {
            Ok(())
        } else {
            Err(self.state_error())
        }
    }

    /// Issue a request in the `Ready` state and wait for its result.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        self.send_request(method, params, timeout, false).await
    }

    /// Issue a request during the handshake (or once ready).
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        self.send_request(method, params, timeout, true).await
    }

    /// Send a notification; no response is expected.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Handshaking | ConnectionState::Ready
        ) {
            return Err(self.state_error());
        }
        let notification = JsonRpcNotification::new(method, params);
        let body = serde_json::to_string(&notification)?;
        tracing::debug!("-> '{}' notification {method}", self.shared.server);
        self.shared.log.record(LogEvent::new(
            &self.shared.server,
            LogKind::Notification,
            json!({
                "direction": "outgoing",
                "method": method,
                "params": notification.params,
            }),
        ));
        self.write_tx
            .send(body)
            .await
            .map_err(|_| self.shared.closed_error())
    }

    /// Close the connection, failing all pending requests with `ConnectionClosed`.
    pub async fn close(&self, reason: impl Into<String>) {
        self.shared.close(reason.into()).await;
    }

    fn state_error(&self) -> McpError {
        match self.state() {
            ConnectionState::Closed => self.shared.closed_error(),
            state => McpError::NotReady {
                server: self.shared.server.clone(),
                state,
            },
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        during_handshake: bool,
    ) -> Result<serde_json::Value, McpError> {
        let (tx, mut rx) = oneshot::channel();
        // Ids are only handed out to requests that are actually sent.
        let (id, request, body) = {
            let mut pending = self.shared.pending();
            let accepted = match self.state() {
                ConnectionState::Ready => true,
                ConnectionState::Handshaking => during_handshake,
                _ => false,
            };
            if !accepted {
                return Err(self.state_error());
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = JsonRpcRequest::new(id, method, params);
            let body = serde_json::to_string(&request)?;
            pending.insert(
                id,
                Pending {
                    slot: tx,
                    method: method.to_string(),
                    sent_at: Instant::now(),
                },
            );
            (id, request, body)
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        tracing::debug!("-> '{}' request {id} ({method})", self.shared.server);
        self.shared.log.record(
            LogEvent::new(
                &self.shared.server,
                LogKind::Request,
                json!({"method": method, "params": request.params}),
            )
            .with_id(id),
        );

        if self.write_tx.send(body).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(self.shared.closed_error());
        }

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                let expired = self.shared.pending().remove(&id);
                if expired.is_some() {
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        "Request {id} ({method}) to '{}' timed out after {timeout_ms}ms",
                        self.shared.server
                    );
                    self.shared.log.record(
                        LogEvent::new(
                            &self.shared.server,
                            LogKind::Error,
                            json!({"method": method, "error": "timeout", "timeout_ms": timeout_ms}),
                        )
                        .with_id(id),
                    );
                    return Err(McpError::Timeout {
                        server: self.shared.server.clone(),
                        method: method.to_string(),
                        timeout_ms,
                    });
                }
                // The reader (or close) claimed the slot first; its outcome is in flight.
                rx.await.unwrap_or_else(|_| Err(self.shared.closed_error()))
            }
        };

        let response = outcome?;
        if let Some(err) = response.error {
            return Err(McpError::JsonRpc {
                server: self.shared.server.clone(),
                code: err.code,
                message: err.message,
            });
        }
        response.result.ok_or_else(|| {
            McpError::Protocol(format!(
                "{method} response has neither result nor error"
            ))
        })
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<String>,
) {
    loop {
        let body = tokio::select! {
            body = rx.recv() => body,
            () = shared.closed.cancelled() => None,
        };
        let Some(body) = body else {
            break;
        };
        if let Err(e) = writer.write_message(&body).await {
            tracing::warn!("Write to '{}' failed: {e}", shared.server);
            shared.close(format!("write failed: {e}")).await;
            break;
        }
    }
    // Closing the stream is the server's signal to exit.
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncBufRead + Unpin>(
    shared: Arc<Shared>,
    mut reader: FrameReader<R>,
    write_tx: mpsc::Sender<String>,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.read_message() => frame,
            () = shared.closed.cancelled() => break,
        };
        match frame {
            Ok(Some(body)) => shared.dispatch(&body, &write_tx),
            Ok(None) => {
                shared
                    .close("server closed its output stream".to_string())
                    .await;
                break;
            }
            Err(e) => {
                tracing::error!("Framing error on '{}': {e}", shared.server);
                shared.log.record(LogEvent::new(
                    &shared.server,
                    LogKind::Error,
                    json!({"error": "framing", "detail": e.to_string()}),
                ));
                shared.close(format!("framing error: {e}")).await;
                break;
            }
        }
    }
}
