use super::{ChatMessage, ChatRequest, LlmError, TokenStream};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

async fn send(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
    stream: bool,
) -> Result<Response, LlmError> {
    let body = OpenAiRequest {
        model: &request.model,
        messages: &request.messages,
        stream,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    debug!(model = %request.model, messages = request.messages.len(), stream, "sending chat completion");
    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

pub async fn chat(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<String, LlmError> {
    let resp = send(client, config, request, false).await?;
    let data: OpenAiResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))?;

    Ok(data
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

/// One SSE line, decoded.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Delta {
        content: Option<String>,
        finished: bool,
    },
    Done,
    Skip,
}

/// Decode a complete SSE line. Lines are split on `\n`, so a whole line is
/// whole UTF-8 unless the server sent invalid bytes.
fn parse_line(line: &[u8]) -> Result<StreamEvent, LlmError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| LlmError::Parse(format!("invalid UTF-8 in stream: {}", e)))?;
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(StreamEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    match serde_json::from_str::<OpenAiStreamResponse>(data) {
        Ok(parsed) => Ok(parsed
            .choices
            .into_iter()
            .next()
            .map_or(StreamEvent::Skip, |choice| StreamEvent::Delta {
                content: choice.delta.content.filter(|c| !c.is_empty()),
                finished: choice.finish_reason.is_some(),
            })),
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream event");
            Ok(StreamEvent::Skip)
        }
    }
}

/// Open a streaming completion and yield content deltas from the SSE body.
pub async fn chat_stream(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<TokenStream, LlmError> {
    let resp = send(client, config, request, true).await?;
    let mut bytes = resp.bytes_stream();

    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut body_done = false;

        while !body_done {
            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    yield Err(LlmError::Http(e));
                    return;
                }
                None => {
                    body_done = true;
                    // flush a final event sent without a newline
                    if !buffer.is_empty() {
                        buffer.push(b'\n');
                    }
                }
            }

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Ok(StreamEvent::Delta { content, finished }) => {
                        if let Some(content) = content {
                            yield Ok(content);
                        }
                        if finished {
                            return;
                        }
                    }
                    Ok(StreamEvent::Done) => return,
                    Ok(StreamEvent::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    };

    Ok(Box::pin(stream))
}
