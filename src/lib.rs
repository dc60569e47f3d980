//! Health assistant chat grounded in uploaded PDF documents.
//!
//! Documents go into a [`DocumentStore`] as overlapping text chunks. For each
//! user message a [`ContextRetriever`] picks the chunks sharing the most words
//! with the message, and a [`ChatSession`] sends them to a chat-completion
//! backend alongside the conversation so far.

pub mod chat;
pub mod chunker;
pub mod config;
pub mod doc_processor;
pub mod llm;
pub mod retriever;
pub mod store;

pub use chat::{ChatSession, History, ReplyStream};
pub use chunker::TextChunker;
pub use config::{AppConfig, ConfigError};
pub use doc_processor::{DocumentError, PageExtractor, PdfExtractor};
pub use llm::{ChatBackend, ChatMessage, LlmClient, LlmError, Provider, RetryPolicy, Role};
pub use retriever::{ContextRetriever, ScoredChunk};
pub use store::{Chunk, DocumentInfo, DocumentStore};
