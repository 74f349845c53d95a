use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskMetadata;
use crate::types::TaskId;

/// Typed lifecycle events emitted by the executor into a progress sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    IterationStarted { iteration: u32, max_iterations: u32 },
    /// Text the model produced alongside a tool request.
    Thinking { text: String },
    ToolRequested {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolCompleted {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
}

/// Phase of a tool call reported in a `tool_use` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolUsePhase {
    Started,
    Completed,
    Failed,
}

/// Kind-specific payload of a wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    Progress {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    ToolUse {
        tool_name: String,
        tool_call_id: String,
        phase: ToolUsePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    Thinking {
        content: String,
    },
    Complete {
        task_id: TaskId,
        result: String,
        metadata: TaskMetadata,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        code: String,
        message: String,
    },
    Heartbeat,
}

impl StreamPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamPayload::Progress { .. } => "progress",
            StreamPayload::ToolUse { .. } => "tool_use",
            StreamPayload::Thinking { .. } => "thinking",
            StreamPayload::Complete { .. } => "complete",
            StreamPayload::Error { .. } => "error",
            StreamPayload::Heartbeat => "heartbeat",
        }
    }

    /// `complete` and `error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamPayload::Complete { .. } | StreamPayload::Error { .. }
        )
    }
}

impl From<ExecutionEvent> for StreamPayload {
    fn from(event: ExecutionEvent) -> Self {
        match event {
            ExecutionEvent::IterationStarted {
                iteration,
                max_iterations,
            } => StreamPayload::Progress {
                message: format!("iteration {}/{}", iteration, max_iterations),
                iteration: Some(iteration),
            },
            ExecutionEvent::Thinking { text } => StreamPayload::Thinking { content: text },
            ExecutionEvent::ToolRequested {
                tool_call_id,
                tool_name,
                input,
            } => StreamPayload::ToolUse {
                tool_name,
                tool_call_id,
                phase: ToolUsePhase::Started,
                input: Some(input),
            },
            ExecutionEvent::ToolCompleted {
                tool_call_id,
                tool_name,
                is_error,
            } => StreamPayload::ToolUse {
                tool_name,
                tool_call_id,
                phase: if is_error {
                    ToolUsePhase::Failed
                } else {
                    ToolUsePhase::Completed
                },
                input: None,
            },
        }
    }
}

/// One message of the push protocol: a payload plus its ISO-8601 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub payload: StreamPayload,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn now(payload: StreamPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}
