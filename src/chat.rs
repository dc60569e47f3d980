use crate::llm::{ChatBackend, ChatMessage, ChatRequest, LlmError, Role, TokenStream};
use crate::retriever::ContextRetriever;
use crate::store::DocumentStore;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, info};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful health assistant. \
     Answer questions about general health, wellness, and lifestyle.";

pub const DEFAULT_TEMPERATURE: f32 = 0.5;

/// Conversation turns in the order they happened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    turns: Vec<ChatMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.turns.push(message);
    }

    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Drop a trailing user turn whose reply never completed.
    fn discard_pending(&mut self) {
        if self.turns.last().map(|m| m.role) == Some(Role::User) {
            self.turns.pop();
        }
    }
}

/// One user's conversation, grounded in whatever documents are passed in.
pub struct ChatSession<B> {
    backend: B,
    retriever: ContextRetriever,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    system_prompt: String,
    history: History,
}

impl<B: ChatBackend> ChatSession<B> {
    pub fn new(backend: B, model: impl Into<String>) -> Self {
        Self {
            backend,
            retriever: ContextRetriever::default(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history: History::new(),
        }
    }

    pub fn with_retriever(mut self, retriever: ContextRetriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// System prompt, then retrieved context if any, then the history.
    pub fn messages_with_context(&self, store: &DocumentStore, user_input: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.as_str())];

        let context = self.retriever.retrieve(store, user_input);
        if !context.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Reference the following information when relevant:\n\n{}",
                context
            )));
        }

        messages.extend(self.history.turns().iter().cloned());
        messages
    }

    fn begin_turn(&mut self, store: &DocumentStore, user_input: &str) -> ChatRequest {
        self.history.push(ChatMessage::user(user_input));
        ChatRequest {
            messages: self.messages_with_context(store, user_input),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub async fn chat(&mut self, store: &DocumentStore, user_input: &str) -> Result<String, LlmError> {
        let request = self.begin_turn(store, user_input);
        info!(model = %self.model, turns = self.history.len(), "chat request");

        match self.backend.chat(&request).await {
            Ok(reply) => {
                self.history.push(ChatMessage::assistant(reply.as_str()));
                Ok(reply)
            }
            Err(e) => {
                self.history.discard_pending();
                Err(e)
            }
        }
    }

    /// Start a streamed reply. The assistant turn is recorded once the
    /// returned stream has been read to the end.
    pub async fn stream_chat(
        &mut self,
        store: &DocumentStore,
        user_input: &str,
    ) -> Result<ReplyStream<'_>, LlmError> {
        let request = self.begin_turn(store, user_input);
        info!(model = %self.model, turns = self.history.len(), "streaming chat request");

        match self.backend.chat_stream(&request).await {
            Ok(inner) => Ok(ReplyStream {
                inner,
                history: &mut self.history,
                reply: String::new(),
                state: ReplyState::Streaming,
            }),
            Err(e) => {
                self.history.discard_pending();
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Streaming,
    Committed,
    Failed,
}

/// Reply fragments pulled from the backend.
///
/// Reading to the end commits the full reply to history. Dropping the stream
/// early, or hitting an upstream error, discards the partial reply together
/// with the user turn that asked for it.
pub struct ReplyStream<'a> {
    inner: TokenStream,
    history: &'a mut History,
    reply: String,
    state: ReplyState,
}

impl ReplyStream<'_> {
    pub fn reply_so_far(&self) -> &str {
        &self.reply
    }

    /// Drain the remaining fragments and return the whole reply.
    pub async fn finish(mut self) -> Result<String, LlmError> {
        while let Some(fragment) = self.next().await {
            fragment?;
        }
        Ok(std::mem::take(&mut self.reply))
    }

    /// Stop reading; nothing is added to history.
    pub fn cancel(self) {}
}

impl Stream for ReplyStream<'_> {
    type Item = Result<String, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state != ReplyState::Streaming {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(fragment))) => {
                this.reply.push_str(&fragment);
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.state = ReplyState::Failed;
                this.history.discard_pending();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.state = ReplyState::Committed;
                this.history.push(ChatMessage::assistant(this.reply.as_str()));
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReplyStream<'_> {
    fn drop(&mut self) {
        if self.state == ReplyState::Streaming {
            debug!(partial = self.reply.len(), "reply stream dropped early, discarding");
            self.history.discard_pending();
        }
    }
}
