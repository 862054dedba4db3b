//! `ApiClient` against a throwaway HTTP server on localhost.

use ferry_api::{ApiClient, RetryConfig};
use ferry_types::{ApiError, CreateMessageRequest, Message, StopReason};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Canned {
    status: u16,
    headers: &'static str,
    body: String,
}

fn canned(status: u16, body: &str) -> Canned {
    Canned {
        status,
        headers: "",
        body: body.to_string(),
    }
}

/// Answer one connection per canned response, in order, and hand back the
/// raw requests that were received.
async fn serve(responses: Vec<Canned>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            seen.push(read_request(&mut socket).await);
            let reply = format!(
                "HTTP/1.1 {} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n{}\r\n{}",
                response.status,
                response.body.len(),
                response.headers,
                response.body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
        seen
    });

    (base_url, handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8(buf).unwrap()
}

fn fast_retries(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_factor: 1.0,
    }
}

fn request() -> CreateMessageRequest {
    CreateMessageRequest {
        model: "test-model".into(),
        max_tokens: 256,
        messages: vec![Message::user_text("suggest a team")],
        system: None,
        tools: None,
    }
}

const OK_BODY: &str = r#"{
    "id": "msg_1",
    "type": "message",
    "role": "assistant",
    "model": "test-model",
    "stop_reason": "end_turn",
    "content": [{"type": "text", "text": "Try Incineroar."}],
    "usage": {"input_tokens": 9, "output_tokens": 4}
}"#;

#[tokio::test]
async fn sends_headers_and_parses_the_reply() {
    let (base_url, server) = serve(vec![canned(200, OK_BODY)]).await;
    let client = ApiClient::new("sk-test", format!("{base_url}/")).unwrap();

    let response = client.create_message(&request()).await.unwrap();
    assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(response.usage.output_tokens, 4);

    let raw = server.await.unwrap().remove(0);
    let lower = raw.to_ascii_lowercase();
    assert!(raw.starts_with("POST /v1/messages HTTP/1.1"), "{raw}");
    assert!(lower.contains("x-api-key: sk-test"));
    assert!(lower.contains("anthropic-version: 2023-06-01"));
    assert!(raw.contains(r#""model":"test-model""#));
}

#[tokio::test]
async fn overloaded_then_success_is_retried() {
    let (base_url, server) = serve(vec![
        canned(529, r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
        Canned {
            status: 429,
            headers: "retry-after: 0\r\n",
            body: "{}".into(),
        },
        canned(200, OK_BODY),
    ])
    .await;
    let client = ApiClient::new("k", base_url)
        .unwrap()
        .with_retry_config(fast_retries(2));

    let response = client.create_message(&request()).await.unwrap();
    assert_eq!(response.id, "msg_1");
    assert_eq!(server.await.unwrap().len(), 3);
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let (base_url, server) = serve(vec![canned(
        400,
        r#"{"type":"error","error":{"type":"invalid_request_error","message":"tools.0.name: invalid"}}"#,
    )])
    .await;
    let client = ApiClient::new("k", base_url)
        .unwrap()
        .with_retry_config(fast_retries(3));

    match client.create_message(&request()).await {
        Err(ApiError::BadRequest { message }) => assert_eq!(message, "tools.0.name: invalid"),
        other => panic!("Expected BadRequest, got {other:?}"),
    }
    assert_eq!(server.await.unwrap().len(), 1);
}

#[tokio::test]
async fn retries_give_up_with_the_last_error() {
    let (base_url, server) =
        serve(vec![canned(500, "upstream broke"), canned(503, "still broken")]).await;
    let client = ApiClient::new("k", base_url)
        .unwrap()
        .with_retry_config(fast_retries(1));

    match client.create_message(&request()).await {
        Err(ApiError::Server { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "still broken");
        }
        other => panic!("Expected Server error, got {other:?}"),
    }
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test]
async fn unparsable_success_body_is_malformed() {
    let (base_url, _server) = serve(vec![canned(200, r#"{"id": 5}"#)]).await;
    let client = ApiClient::new("k", base_url)
        .unwrap()
        .with_retry_config(fast_retries(0));

    assert!(matches!(
        client.create_message(&request()).await,
        Err(ApiError::MalformedResponse(_))
    ));
}
