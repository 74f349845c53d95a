//! Scripted completion client for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loom_core::{LoomError, Message, MessageContent, Result, Role, ToolCall};
use parking_lot::Mutex;

use crate::provider::*;

/// A mock client that replays queued responses in order.
///
/// # Example
/// ```
/// use loom_llm::mock::MockClient;
/// let client = MockClient::new()
///     .with_tool_call("list_categories", serde_json::json!({}))
///     .with_response("groceries, rent");
/// ```
#[derive(Clone, Default)]
pub struct MockClient {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    /// Served once the queue is empty. Defaults to a placeholder text answer.
    fallback: Arc<Mutex<Option<MockResponse>>>,
    /// Every request received, for assertions in tests.
    requests: Arc<Mutex<Vec<LlmRequest>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

/// A pre-configured response from the mock client.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// If set, the client returns this error instead.
    pub error: Option<String>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            },
            error: None,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn tool_call(name: &str, args: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                tool_name: name.to_string(),
                arguments: args,
            }],
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(MockResponse::text(text));
        self
    }

    /// Queue a single tool call response.
    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        self.responses.lock().push_back(MockResponse::tool_call(name, args));
        self
    }

    /// Queue one response requesting several tools at once.
    pub fn with_tool_calls(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        let tool_calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{}_{}", i, uuid::Uuid::new_v4()),
                tool_name: name.to_string(),
                arguments: args,
            })
            .collect();
        self.responses.lock().push_back(MockResponse {
            tool_calls,
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        });
        self
    }

    /// Queue a response cut off by the output token limit.
    pub fn with_max_tokens(self, partial: &str) -> Self {
        self.responses.lock().push_back(MockResponse {
            text: partial.to_string(),
            stop_reason: StopReason::MaxTokens,
            ..Default::default()
        });
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push_back(MockResponse::error(error));
        self
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push_back(resp);
        self
    }

    /// Keep requesting `name` forever once the queue runs dry.
    pub fn always_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        *self.fallback.lock() = Some(MockResponse::tool_call(name, args));
        self
    }

    /// Fail every call once the queue runs dry.
    pub fn always_error(self, error: &str) -> Self {
        *self.fallback.lock() = Some(MockResponse::error(error));
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// All requests made to this client.
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    /// Number of `complete` calls received, including ones still sleeping.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        if let Some(resp) = self.responses.lock().pop_front() {
            return resp;
        }
        match self.fallback.lock().clone() {
            Some(mut resp) => {
                // Fresh correlation ids on every repeat.
                for tc in &mut resp.tool_calls {
                    tc.id = format!("call_{}", uuid::Uuid::new_v4());
                }
                resp
            }
            None => MockResponse::text("(mock: no more queued responses)"),
        }
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let mock = self.next_response();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = mock.error {
            return Err(LoomError::LlmProvider(error));
        }

        let mut msg = Message::text(Role::Assistant, "");
        msg.content = if mock.text.is_empty() {
            vec![]
        } else {
            vec![MessageContent::Text { text: mock.text }]
        };
        let has_tool_calls = !mock.tool_calls.is_empty();
        msg.tool_calls = mock.tool_calls;

        Ok(LlmResponse {
            message: msg,
            usage: mock.usage,
            has_tool_calls,
            stop_reason: mock.stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> LlmRequest {
        LlmRequest {
            model: "test".into(),
            messages: vec![],
            tools: vec![],
            system: None,
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    #[tokio::test]
    async fn test_mock_text_response() {
        let client = MockClient::new().with_response("Hello!");
        let resp = client.complete(&req()).await.unwrap();
        assert_eq!(resp.message.text_content(), "Hello!");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert!(!resp.has_tool_calls);
    }

    #[tokio::test]
    async fn test_mock_tool_call() {
        let client =
            MockClient::new().with_tool_call("list_categories", serde_json::json!({"limit": 2}));
        let resp = client.complete(&req()).await.unwrap();
        assert!(resp.has_tool_calls);
        assert_eq!(resp.message.tool_calls[0].tool_name, "list_categories");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn test_mock_error() {
        let client = MockClient::new().with_error("HTTP 500");
        let err = client.complete(&req()).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_mock_in_order_then_placeholder() {
        let client = MockClient::new().with_response("first").with_response("second");
        assert_eq!(client.complete(&req()).await.unwrap().message.text_content(), "first");
        assert_eq!(client.complete(&req()).await.unwrap().message.text_content(), "second");
        let third = client.complete(&req()).await.unwrap();
        assert!(third.message.text_content().contains("no more queued"));
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.recorded_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_always_tool_call_uses_fresh_ids() {
        let client = MockClient::new().always_tool_call("x", serde_json::json!({}));
        let a = client.complete(&req()).await.unwrap();
        let b = client.complete(&req()).await.unwrap();
        assert!(a.has_tool_calls && b.has_tool_calls);
        assert_ne!(a.message.tool_calls[0].id, b.message.tool_calls[0].id);
    }

    #[tokio::test]
    async fn test_clones_share_script() {
        let client = MockClient::new().with_response("only once");
        let clone = client.clone();
        let _ = clone.complete(&req()).await.unwrap();
        assert_eq!(client.call_count(), 1);
        let next = client.complete(&req()).await.unwrap();
        assert!(next.message.text_content().contains("no more queued"));
    }
}
