use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier for a task. Doubles as the job id on the queue path.
pub type TaskId = String;

/// Tenant scope carried by every downstream operation.
pub type OwnerId = String;

/// Generate a fresh task id.
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// Token counts accumulated across every model call of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
    }
}
