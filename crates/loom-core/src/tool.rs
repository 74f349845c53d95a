use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::types::{OwnerId, TaskId};

/// Declared signature of an operation the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name, e.g. "list_categories".
    pub name: String,
    /// Human-readable description for the LLM.
    pub description: String,
    /// JSON Schema of the input object.
    pub parameters: Value,
}

/// A request from the LLM to call a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Result of one invocation, correlated to the call that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}

/// Identity bound to every tool call of one execution. Tool input can never
/// override it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub owner_id: OwnerId,
    pub task_id: TaskId,
    /// 1-based attempt of the surrounding job. Direct executions run once.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl ToolContext {
    pub fn new(owner_id: impl Into<OwnerId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            task_id: task_id.into(),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// What a handler hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    /// A handled failure the model should see and may recover from.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// An operation callable by the model. Implementations scope every effect to
/// `ctx.owner_id`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;

    async fn invoke(&self, input: Value, ctx: &ToolContext) -> crate::Result<ToolOutput>;
}

/// Name-keyed lookup table of tool handlers. Immutable once built and shared
/// across executions.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        self.handlers.insert(name, handler);
    }

    pub fn with(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Declared schemas, sorted by name so requests are deterministic.
    pub fn definitions(&self) -> Vec<Tool> {
        let mut defs: Vec<Tool> = self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one call. Never fails: unknown tools and handler errors become
    /// error outcomes tagged with the call id.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let started = Instant::now();
        let Some(handler) = self.get(&call.tool_name) else {
            warn!(task_id = %ctx.task_id, tool = %call.tool_name, "tool not found");
            let err = crate::LoomError::ToolNotFound(call.tool_name.clone());
            return ToolOutcome {
                tool_call_id: call.id.clone(),
                tool_name: call.tool_name.clone(),
                output: format!("Error: {}", err),
                is_error: true,
            };
        };

        let (output, is_error) = match handler.invoke(call.arguments.clone(), ctx).await {
            Ok(out) => (out.text, out.is_error),
            Err(e) => {
                let err = crate::LoomError::ToolExecution {
                    tool: call.tool_name.clone(),
                    reason: e.to_string(),
                };
                (format!("Error: {}", err), true)
            }
        };

        info!(
            task_id = %ctx.task_id,
            owner_id = %ctx.owner_id,
            tool = %call.tool_name,
            is_error,
            duration_ms = started.elapsed().as_millis() as u64,
            "tool invoked"
        );

        ToolOutcome {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            output,
            is_error,
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
