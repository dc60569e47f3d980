pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Reply fragments in arrival order.
pub type TokenStream = BoxStream<'static, Result<String, LlmError>>;

/// A chat-completion service, blocking or streaming.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError>;

    async fn chat_stream(&self, request: &ChatRequest) -> Result<TokenStream, LlmError>;
}

/// OpenAI-compatible endpoints the client knows how to reach.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Together(openai::OpenAiConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn openai(api_key: String) -> Self {
        Provider::OpenAi(openai::OpenAiConfig {
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    pub fn together(api_key: String) -> Self {
        Provider::Together(openai::OpenAiConfig {
            api_key,
            base_url: "https://api.together.xyz/v1".to_string(),
        })
    }

    pub fn ollama(host: String) -> Self {
        Provider::Ollama(openai::OpenAiConfig {
            api_key: String::new(),
            base_url: format!("{}/v1", host.trim_end_matches('/')),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        match &mut self {
            Provider::OpenAi(config) | Provider::Together(config) | Provider::Ollama(config) => {
                config.base_url = base_url.trim_end_matches('/').to_string();
            }
        }
        self
    }

    pub fn config(&self) -> &openai::OpenAiConfig {
        match self {
            Provider::OpenAi(config) | Provider::Together(config) | Provider::Ollama(config) => {
                config
            }
        }
    }
}

/// How often, and how patiently, transient failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Chat-completion client for a [`Provider`], retrying transient failures.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: Provider,
    retry: RetryPolicy,
    http: Client,
}

impl LlmClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            http: Client::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, LlmError>> + Send,
        T: Send,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempts > self.retry.max_retries {
                        return Err(LlmError::Upstream {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.retry.backoff(attempts);
                    warn!(attempts, ?delay, error = %e, "chat completion failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let config = self.provider.config();
        self.with_retries(|| openai::chat(&self.http, config, request))
            .await
    }

    /// Only establishing the stream is retried; a stream that breaks midway
    /// surfaces its error to the consumer.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let config = self.provider.config();
        self.with_retries(|| openai::chat_stream(&self.http, config, request))
            .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Upstream failed after {attempts} attempts: {source}")]
    Upstream {
        attempts: u32,
        source: Box<LlmError>,
    },
}

impl LlmError {
    /// Connection problems, timeouts, rate limits and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Parse(_) | LlmError::Upstream { .. } => false,
        }
    }
}
