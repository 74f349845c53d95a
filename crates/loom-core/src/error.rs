use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the entire Loom engine.
#[derive(Error, Debug)]
pub enum LoomError {
    // ── Task-level errors ──────────────────────────────────────
    #[error("task timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("iteration limit exceeded: model still requesting tools after {max} iterations")]
    IterationLimitExceeded { max: u32 },

    #[error("execution error: {0}")]
    Execution(String),

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Tracker errors ─────────────────────────────────────────
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    // ── LLM errors ─────────────────────────────────────────────
    #[error("llm provider error: {0}")]
    LlmProvider(String),

    #[error("llm rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Infrastructure errors ──────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LoomError {
    /// Stable, machine-readable code used in every error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            LoomError::Timeout { .. } => "TIMEOUT",
            LoomError::IterationLimitExceeded { .. } => "ITERATION_LIMIT_EXCEEDED",
            LoomError::Execution(_) => "EXECUTION_ERROR",
            LoomError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            LoomError::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            LoomError::AlreadyExists(_) => "ALREADY_EXISTS",
            LoomError::NotFound(_) => "NOT_FOUND",
            LoomError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            LoomError::RateLimited { .. } => "RATE_LIMITED",
            LoomError::Config(_) => "CONFIG_ERROR",
            LoomError::Store(_) => "STORE_ERROR",
            LoomError::Queue(_) => "QUEUE_ERROR",
            LoomError::Io(_) => "IO_ERROR",
            LoomError::Serialization(_) => "SERIALIZATION_ERROR",
            LoomError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a queued job failing with this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LoomError::AlreadyExists(_) | LoomError::NotFound(_) | LoomError::Config(_)
        )
    }

    /// Fold any error escaping the model/tool layer into the three task-level kinds.
    pub fn into_task_error(self) -> LoomError {
        match self {
            e @ (LoomError::Timeout { .. }
            | LoomError::IterationLimitExceeded { .. }
            | LoomError::Execution(_)) => e,
            other => LoomError::Execution(other.to_string()),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// `{ code, message }` payload shared by sync responses, terminal stream
/// events, and failed task records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&LoomError> for ErrorEnvelope {
    fn from(err: &LoomError) -> Self {
        err.envelope()
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
