use async_trait::async_trait;
use daycare_core::{Message, Result, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Model-ready conversation handed to a client.
#[derive(Debug, Clone, Default)]
pub struct InferenceContext {
    /// System prompt (separate from messages for providers that support it).
    pub system: Option<String>,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tools the model may call natively.
    pub tools: Vec<Tool>,
}

/// Per-call options forwarded to the client.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Stable id for provider-side caching and tracing.
    pub session_id: Option<String>,
    /// Stop sequences. Generation halts before emitting any of these.
    pub stop: Vec<String>,
}

/// A complete response from a model.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub message: Message,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// A provider implementation (Anthropic, OpenAI, local, ...) registered by id.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Registry id, matched against `ProviderSettings::id`.
    fn id(&self) -> &str;

    /// Build a live client for `model`. Failing here means the provider is
    /// unavailable right now (missing credentials, unreachable endpoint, ...).
    async fn create_client(&self, model: &str, options: &Value) -> Result<Arc<dyn InferenceClient>>;
}

/// A client bound to one model.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn model_id(&self) -> &str;

    /// Send one non-streaming request.
    async fn complete(
        &self,
        context: &InferenceContext,
        options: &CompletionOptions,
    ) -> Result<InferenceResponse>;
}
