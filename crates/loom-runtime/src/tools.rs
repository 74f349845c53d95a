//! Built-in tools available to every engine.

use async_trait::async_trait;
use chrono::Utc;
use loom_core::{Result, Tool, ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use serde_json::{Value, json};

/// Registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    ToolRegistry::new().with(EchoTool).with(CurrentTimeTool)
}

/// Repeats its `text` input back. Useful for wiring checks.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "echo".into(),
            description: "Repeat the given text back verbatim.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to repeat" }
                },
                "required": ["text"]
            }),
        }
    }

    async fn invoke(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        match input.get("text").and_then(Value::as_str) {
            Some(text) => Ok(ToolOutput::ok(text)),
            None => Ok(ToolOutput::error("missing required string field 'text'")),
        }
    }
}

/// Current UTC time, RFC 3339.
pub struct CurrentTimeTool;

#[async_trait]
impl ToolHandler for CurrentTimeTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "current_time".into(),
            description: "Get the current date and time in UTC (RFC 3339).".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn invoke(&self, _input: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        Ok(ToolOutput::ok(Utc::now().to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::ToolCall;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn test_builtin_registry_contents() {
        let registry = builtin_registry();
        let names: Vec<String> = registry.definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["current_time", "echo"]);
    }

    #[tokio::test]
    async fn test_echo_requires_text() {
        let registry = builtin_registry();
        let ctx = ToolContext::new("alice", "t1");
        let ok = registry.dispatch(&call("echo", json!({"text": "hi"})), &ctx).await;
        assert_eq!(ok.output, "hi");
        assert!(!ok.is_error);

        let bad = registry.dispatch(&call("echo", json!({})), &ctx).await;
        assert!(bad.is_error);
    }

    #[tokio::test]
    async fn test_current_time_parses() {
        let out = CurrentTimeTool
            .invoke(json!({}), &ToolContext::new("alice", "t1"))
            .await
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out.text).is_ok());
    }
}
