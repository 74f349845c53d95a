use async_trait::async_trait;
use loom_core::{Message, Result, Tool};
use serde::{Deserialize, Serialize};

/// A request to the completion provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The model to use, e.g. "claude-sonnet-4-20250514" (provider-specific part).
    pub model: String,
    /// Full conversation so far.
    pub messages: Vec<Message>,
    /// Declared tool schemas.
    pub tools: Vec<Tool>,
    /// System prompt (separate from messages for providers that support it).
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A complete response from the model.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Assistant turn: text segments plus any requested tool calls.
    pub message: Message,
    pub usage: Usage,
    /// Whether the model wants tools run before it continues.
    pub has_tool_calls: bool,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

impl StopReason {
    /// Natural completion: the model is done and produced its answer.
    pub fn is_natural(self) -> bool {
        matches!(self, StopReason::EndTurn | StopReason::StopSequence)
    }
}

/// Token usage statistics for one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
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

/// Trait implemented by every completion backend. Must be safe to share
/// across concurrently running executions.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Human-readable name, e.g. "anthropic", "mock".
    fn name(&self) -> &str;

    /// Send one request and wait for the full response.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;
}
