//! # loom-llm
//!
//! Abstraction over the LLM provider. The executor only sees
//! [`CompletionClient`]: a conversation plus declared tools in, text segments,
//! tool calls, and a stop reason out.

pub mod anthropic;
pub mod mock;
pub mod provider;

pub use anthropic::AnthropicClient;
pub use mock::{MockClient, MockResponse};
pub use provider::{CompletionClient, LlmRequest, LlmResponse, StopReason, Usage};
