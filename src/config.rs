//! TOML configuration for the health bot (`health-bot.toml`).
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working setup against Together's hosted Llama 3. API keys are never read
//! from the file, only from the environment variable named by `api_key_env`.

use crate::chat::{ChatSession, DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE};
use crate::chunker::{TextChunker, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_SEPARATORS};
use crate::doc_processor::PdfExtractor;
use crate::llm::{LlmClient, Provider, RetryPolicy};
use crate::retriever::{ContextRetriever, DEFAULT_TOP_K};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("API key not configured: set {0}")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            store: StoreConfig::default(),
            chat: ChatConfig::default(),
            log_level: default_log_level(),
        }
    }
}

// ============= LLM Configuration =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Together,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Overrides the provider's standard endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_provider() -> ProviderKind {
    ProviderKind::Together
}

fn default_model() -> String {
    "meta-llama/Llama-3-70b-chat-hf".to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key_env: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl LlmConfig {
    pub fn api_key_env(&self) -> &str {
        match (&self.api_key_env, self.provider) {
            (Some(name), _) => name,
            (None, ProviderKind::OpenAi) => "OPENAI_API_KEY",
            (None, ProviderKind::Together) => "TOGETHER_API_KEY",
            (None, ProviderKind::Ollama) => "OLLAMA_API_KEY",
        }
    }

    /// Resolve the provider, reading the API key from the environment.
    /// Ollama runs locally and needs no key.
    pub fn provider(&self) -> Result<Provider, ConfigError> {
        let key_var = self.api_key_env();
        let api_key = std::env::var(key_var).ok().filter(|k| !k.is_empty());

        let provider = match self.provider {
            ProviderKind::OpenAi => Provider::openai(
                api_key.ok_or_else(|| ConfigError::MissingApiKey(key_var.to_string()))?,
            ),
            ProviderKind::Together => Provider::together(
                api_key.ok_or_else(|| ConfigError::MissingApiKey(key_var.to_string()))?,
            ),
            ProviderKind::Ollama => Provider::ollama("http://localhost:11434".to_string()),
        };

        Ok(match &self.base_url {
            Some(url) => provider.with_base_url(url.as_str()),
            None => provider,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

// ============= Document Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker(&self) -> TextChunker {
        TextChunker::new(self.chunk_size, self.chunk_overlap).with_separators(self.separators.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub skip_zero_scores: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            skip_zero_scores: false,
        }
    }
}

impl RetrievalConfig {
    pub fn retriever(&self) -> ContextRetriever {
        ContextRetriever::new(self.top_k).with_skip_zero_scores(self.skip_zero_scores)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub disambiguate_ids: bool,
    /// Where uploads are staged for text extraction; the system temporary
    /// directory when unset.
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

// ============= Loading =============

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunking.chunk_size must be positive".into()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".into()));
        }
        Ok(())
    }

    /// An empty store that parses PDFs with the configured chunking.
    pub fn document_store(&self) -> DocumentStore {
        let store = DocumentStore::new(self.chunking.chunker(), PdfExtractor)
            .with_disambiguated_ids(self.store.disambiguate_ids);
        match &self.store.temp_dir {
            Some(dir) => store.with_temp_dir(dir.clone()),
            None => store,
        }
    }

    pub fn chat_session(&self) -> Result<ChatSession<LlmClient>, ConfigError> {
        let client = LlmClient::new(self.llm.provider()?).with_retry_policy(self.llm.retry_policy());
        Ok(ChatSession::new(client, self.llm.model.as_str())
            .with_retriever(self.retrieval.retriever())
            .with_system_prompt(self.chat.system_prompt.as_str())
            .with_temperature(self.llm.temperature)
            .with_max_tokens(self.llm.max_tokens))
    }
}
