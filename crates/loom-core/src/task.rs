use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorEnvelope;
use crate::types::{OwnerId, TaskId, TokenUsage};

/// Lifecycle status of a task. Transitions only move forward:
/// `Pending → InProgress → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    /// Skipping `InProgress` is allowed; re-entering an earlier state is not.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution statistics recorded on a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub tools_used: u32,
    pub iterations: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Retries consumed on the queue path; 0 for a first-attempt outcome.
    #[serde(default)]
    pub attempt_count: u32,
}

/// One execution request and everything recorded about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub instruction: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_id: impl Into<TaskId>,
        owner_id: impl Into<OwnerId>,
        instruction: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            metadata: TaskMetadata::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
