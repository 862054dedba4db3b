//! In-process MCP server over `tokio::io::duplex` for integration tests.

#![allow(dead_code)]

use ferry_mcp::framing::{FrameReader, FrameWriter};
use ferry_mcp::{ClientOptions, McpClient};
use ferry_session::InteractionLog;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the mock answers one `tools/call`.
#[derive(Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    Never,
}

pub struct Planned {
    pub delay: Duration,
    pub reply: Reply,
}

impl Planned {
    pub fn now(reply: Reply) -> Self {
        Self {
            delay: Duration::ZERO,
            reply,
        }
    }

    pub fn after(ms: u64, reply: Reply) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            reply,
        }
    }
}

type Handler = Arc<dyn Fn(&str, &Value) -> Planned + Send + Sync>;

/// Text result as a server would send it.
pub fn text_result(text: &str) -> Reply {
    Reply::Result(json!({"content": [{"type": "text", "text": text}], "isError": false}))
}

pub fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": {"format": {"type": "string"}}}
    })
}

pub type ClientReader = BufReader<ReadHalf<DuplexStream>>;
pub type ClientWriter = WriteHalf<DuplexStream>;

pub struct MockServer {
    pub calls: Arc<Mutex<Vec<Value>>>,
    pub notifications: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MockServer {
    /// Serve `pages` of tools (one `tools/list` response per page) and answer
    /// calls with `handler`. Returns the client's ends of the pipe.
    pub fn start<F>(pages: Vec<Vec<Value>>, handler: F) -> (Self, ClientReader, ClientWriter)
    where
        F: Fn(&str, &Value) -> Planned + Send + Sync + 'static,
    {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(server_write);
            while let Some(message) = out_rx.recv().await {
                if writer.write_message(&message.to_string()).await.is_err() {
                    break;
                }
            }
        });
        let task = tokio::spawn(serve(
            server_read,
            out_tx,
            pages,
            handler,
            Arc::clone(&calls),
            Arc::clone(&notifications),
        ));

        let server = Self {
            calls,
            notifications,
            task,
            writer,
        };
        (server, BufReader::new(client_read), client_write)
    }

    /// Drop the server's end of the pipe, as a crashed process would.
    pub fn crash(&self) {
        self.task.abort();
        self.writer.abort();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.crash();
    }
}

/// Connect a client to a fresh mock server.
pub async fn connect<F>(
    name: &str,
    pages: Vec<Vec<Value>>,
    tool_timeout: Duration,
    handler: F,
) -> (MockServer, McpClient)
where
    F: Fn(&str, &Value) -> Planned + Send + Sync + 'static,
{
    let (server, reader, writer) = MockServer::start(pages, handler);
    let mut options = ClientOptions::new(InteractionLog::disabled());
    options.request_timeout = Duration::from_secs(2);
    options.tool_timeout = tool_timeout;
    let client = McpClient::connect_streams(name, reader, writer, options)
        .await
        .unwrap();
    (server, client)
}

async fn serve(
    read: ReadHalf<DuplexStream>,
    out_tx: mpsc::UnboundedSender<Value>,
    pages: Vec<Vec<Value>>,
    handler: Handler,
    calls: Arc<Mutex<Vec<Value>>>,
    notifications: Arc<Mutex<Vec<String>>>,
) {
    let mut reader = FrameReader::new(BufReader::new(read));
    let mut responders = Vec::new();

    while let Ok(Some(body)) = reader.read_message().await {
        let message: Value = serde_json::from_str(&body).unwrap();
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = message.get("id").cloned() else {
            notifications.lock().unwrap().push(method);
            continue;
        };

        let respond = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result});
        match method.as_str() {
            "initialize" => {
                let _ = out_tx.send(respond(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "0.0.1"}
                })));
            }
            "tools/list" => {
                let page = message["params"]["cursor"]
                    .as_str()
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut result = json!({"tools": pages.get(page).cloned().unwrap_or_default()});
                if page + 1 < pages.len() {
                    result["nextCursor"] = json!((page + 1).to_string());
                }
                let _ = out_tx.send(respond(result));
            }
            "tools/call" => {
                let params = message["params"].clone();
                calls.lock().unwrap().push(params.clone());
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let planned = handler(&name, &params["arguments"]);
                let out_tx = out_tx.clone();
                let id = id.clone();
                responders.push(tokio::spawn(async move {
                    tokio::time::sleep(planned.delay).await;
                    let message = match planned.reply {
                        Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Reply::Error(code, msg) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": code, "message": msg}
                        }),
                        Reply::Never => return,
                    };
                    let _ = out_tx.send(message);
                }));
            }
            _ => {
                let _ = out_tx.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                }));
            }
        }
    }

    for responder in responders {
        responder.abort();
    }
}
