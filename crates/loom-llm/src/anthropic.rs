use async_trait::async_trait;
use loom_core::{LoomError, Message, MessageContent, Result, Role, ToolCall};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::provider::*;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.anthropic.com/v1".into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn build_request_body(&self, request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => continue, // sent via top-level "system"
                Role::User => {
                    messages.push(json!({
                        "role": "user",
                        "content": msg.text_content(),
                    }));
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        messages.push(json!({
                            "role": "assistant",
                            "content": msg.text_content(),
                        }));
                        continue;
                    }
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = msg.text_content();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.tool_name,
                            "input": tc.arguments,
                        }));
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    let blocks: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|block| match block {
                            MessageContent::ToolResult {
                                tool_call_id,
                                content,
                                is_error,
                            } => Some(json!({
                                "type": "tool_result",
                                "tool_use_id": tool_call_id,
                                "content": content,
                                "is_error": is_error,
                            })),
                            _ => None,
                        })
                        .collect();
                    // Consecutive tool results must share one user turn.
                    let merged = match messages.last_mut() {
                        Some(last) if last["role"] == "user" && last["content"].is_array() => {
                            if let Some(arr) = last["content"].as_array_mut() {
                                arr.extend(blocks.iter().cloned());
                            }
                            true
                        }
                        _ => false,
                    };
                    if !merged {
                        messages.push(json!({"role": "user", "content": blocks}));
                    }
                }
            }
        }

        let mut body = json!({
            "model": model_id(&request.model),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });

        if let Some(ref system) = request.system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        body
    }
}

/// Strip the "anthropic/" routing prefix used in config.
fn model_id(model: &str) -> &str {
    model.strip_prefix("anthropic/").unwrap_or(model)
}

/// Turn a Messages API response body into our standard shape.
pub(crate) fn parse_response(data: &Value) -> LlmResponse {
    let blocks = data["content"].as_array().cloned().unwrap_or_default();

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    for b in &blocks {
        match b["type"].as_str() {
            Some("text") => {
                if let Some(text) = b["text"].as_str() {
                    content.push(MessageContent::Text {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: b["id"].as_str().unwrap_or_default().to_string(),
                tool_name: b["name"].as_str().unwrap_or_default().to_string(),
                arguments: b["input"].clone(),
            }),
            _ => {}
        }
    }

    let has_tool_calls = !tool_calls.is_empty();
    let stop_reason = match data["stop_reason"].as_str() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("refusal") => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    };

    let usage_data = &data["usage"];
    let read = |key: &str| usage_data[key].as_u64().unwrap_or(0) as u32;

    let mut message = Message::text(Role::Assistant, "");
    message.content = content;
    message.tool_calls = tool_calls;

    LlmResponse {
        message,
        usage: Usage {
            input_tokens: read("input_tokens"),
            output_tokens: read("output_tokens"),
            cache_read_tokens: read("cache_read_input_tokens"),
            cache_write_tokens: read("cache_creation_input_tokens"),
        },
        has_tool_calls,
        stop_reason,
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request_body(request);
        debug!(model = %request.model, messages = request.messages.len(), "sending Anthropic API request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LoomError::LlmProvider(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            if status.as_u16() == 429 {
                let retry_after_secs = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30);
                return Err(LoomError::RateLimited { retry_after_secs });
            }
            let text = resp.text().await.unwrap_or_default();
            return Err(LoomError::LlmProvider(format!("HTTP {status}: {text}")));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| LoomError::LlmProvider(e.to_string()))?;

        Ok(parse_response(&data))
    }
}
