//! Chat-completion client tests against a mock OpenAI-compatible server.
//!
//! Covers blocking and streamed replies, retrying of transient failures and
//! the error surfaced once retries run out.

use futures::StreamExt;
use health_bot::llm::{ChatBackend, ChatMessage, ChatRequest, LlmClient, LlmError, Provider, RetryPolicy};
use health_bot::{ChatSession, DocumentStore};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> LlmClient {
    let provider = Provider::together("test-key".to_string()).with_base_url(server.uri());
    LlmClient::new(provider).with_retry_policy(RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
    })
}

fn request(content: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::user(content)],
        model: "meta-llama/Llama-3-70b-chat-hf".to_string(),
        temperature: 0.5,
        max_tokens: None,
    }
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let event = json!({"choices": [{"index": 0, "delta": {"content": fragment}, "finish_reason": null}]});
        body.push_str(&format!("data: {}\n\n", event));
    }
    let last = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]});
    body.push_str(&format!("data: {}\n\n", last));
    body.push_str("data: [DONE]\n\n");
    body
}

fn delta_event(fragment: &str) -> String {
    let event = json!({"choices": [{"index": 0, "delta": {"content": fragment}, "finish_reason": null}]});
    format!("data: {}\n\n", event)
}

/// Read one HTTP request, headers and body, off the socket.
async fn read_request(socket: &mut TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + body_len {
                return;
            }
        }
    }
}

/// Serve a single streamed response whose body goes out as the given
/// chunked-encoding pieces, with a pause between pieces so each arrives
/// as its own read.
async fn serve_chunked(pieces: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: text/event-stream\r\n\
                  Transfer-Encoding: chunked\r\n\
                  Connection: close\r\n\r\n",
            )
            .await
            .unwrap();
        for piece in pieces {
            socket
                .write_all(format!("{:x}\r\n", piece.len()).as_bytes())
                .await
                .unwrap();
            socket.write_all(&piece).await.unwrap();
            socket.write_all(b"\r\n").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        socket.write_all(b"0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    });

    format!("http://{}", addr)
}

/// Body bytes split inside the first multibyte character of `needle`.
fn split_inside(body: &str, needle: char) -> Vec<Vec<u8>> {
    let at = body.find(needle).unwrap() + 1;
    let bytes = body.as_bytes();
    vec![bytes[..at].to_vec(), bytes[at..].to_vec()]
}

fn raw_client(base_url: String) -> LlmClient {
    LlmClient::new(Provider::together("test-key".to_string()).with_base_url(base_url))
}

// ============= Blocking =============

#[tokio::test]
async fn test_chat_returns_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "meta-llama/Llama-3-70b-chat-hf",
            "stream": false,
            "temperature": 0.5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Stay hydrated.")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server).chat(&request("tips?")).await.unwrap();
    assert_eq!(reply, "Stay hydrated.");
}

#[tokio::test]
async fn test_chat_sends_max_tokens_only_when_set() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"max_tokens": 64})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("short")))
        .expect(1)
        .mount(&server)
        .await;

    let mut req = request("be brief");
    req.max_tokens = Some(64);
    assert_eq!(client(&server).chat(&req).await.unwrap(), "short");
}

// ============= Streaming =============

#[tokio::test]
async fn test_stream_yields_fragments() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Eat ", "more ", "greens."])),
        )
        .mount(&server)
        .await;

    let stream = client(&server).chat_stream(&request("diet?")).await.unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["Eat ", "more ", "greens."]);
}

#[tokio::test]
async fn test_session_streams_against_server() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&["Sleep ", "8 hours."])))
        .mount(&server)
        .await;

    let store = DocumentStore::default();
    let mut session = ChatSession::new(client(&server), "meta-llama/Llama-3-70b-chat-hf");

    let reply = session
        .stream_chat(&store, "how much sleep?")
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(reply, "Sleep 8 hours.");
    assert_eq!(
        session.history().turns(),
        &[
            ChatMessage::user("how much sleep?"),
            ChatMessage::assistant("Sleep 8 hours."),
        ]
    );
}

#[tokio::test]
async fn test_stream_keeps_characters_split_across_reads() {
    let body = sse_body(&["37°C"]);
    let base_url = serve_chunked(split_inside(&body, '°')).await;

    let stream = raw_client(base_url).chat_stream(&request("fever?")).await.unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["37°C"]);
}

#[tokio::test]
async fn test_session_records_characters_split_across_reads() {
    let body = sse_body(&["Dose: 5 µg, ", "take with water."]);
    let base_url = serve_chunked(split_inside(&body, 'µ')).await;

    let store = DocumentStore::default();
    let mut session = ChatSession::new(raw_client(base_url), "meta-llama/Llama-3-70b-chat-hf");

    let reply = session
        .stream_chat(&store, "vitamin d?")
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(reply, "Dose: 5 µg, take with water.");
    assert_eq!(
        session.history().turns()[1],
        ChatMessage::assistant("Dose: 5 µg, take with water.")
    );
}

#[tokio::test]
async fn test_stream_rejects_invalid_utf8() {
    let mut body = delta_event("fine ").into_bytes();
    body.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\"\xff\"}}]}\n\n");
    let base_url = serve_chunked(vec![body]).await;

    let stream = raw_client(base_url).chat_stream(&request("hi")).await.unwrap();
    let results: Vec<Result<String, LlmError>> = stream.collect().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), "fine ");
    assert!(matches!(results[1], Err(LlmError::Parse(_))));
}

#[tokio::test]
async fn test_stream_reads_final_event_without_newline() {
    let server = MockServer::start().await;

    let last = json!({"choices": [{"index": 0, "delta": {"content": "water."}, "finish_reason": "stop"}]});
    let body = format!("{}data: {}", delta_event("Drink "), last);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let stream = client(&server).chat_stream(&request("thirsty")).await.unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["Drink ", "water."]);
}

// ============= Retries =============

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Recovered.")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server).chat(&request("hello")).await.unwrap();
    assert_eq!(reply, "Recovered.");
}

#[tokio::test]
async fn test_retries_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).chat(&request("hello")).await.unwrap_err();
    match err {
        LlmError::Upstream { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, LlmError::Api { status: 429, .. }));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).chat_stream(&request("hello")).await.err().unwrap();
    match err {
        LlmError::Api { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_chat_keeps_history_clean() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = DocumentStore::default();
    let mut session = ChatSession::new(client(&server), "meta-llama/Llama-3-70b-chat-hf");

    let err = session.chat(&store, "hello").await.unwrap_err();
    assert!(matches!(err, LlmError::Upstream { attempts: 3, .. }));
    assert!(session.history().is_empty());
}
