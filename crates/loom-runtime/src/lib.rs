//! # loom-runtime
//!
//! The engine that turns a natural-language instruction into a tracked,
//! tool-using agent execution.
//!
//! ## Architecture
//!
//! ```text
//!     sync ──┐    stream ──┐          queue ──┐
//!            │             │                  ▼
//!            │             │           ┌────────────┐
//!            │             │           │ Task Queue │ ← durable, idempotent
//!            │             │           └─────┬──────┘
//!            │             │                 ▼
//!            │             │           ┌────────────┐
//!            │             │           │ Worker Pool│ ← concurrency, rate
//!            │             │           └─────┬──────┘   limit, retries
//!            │             ▼                 │
//!            │     ┌───────────────┐         │
//!            │     │ Stream Handle │         │
//!            │     └───────┬───────┘         │
//!            ▼             ▼                 ▼
//!          ┌─────────────────────────────────────┐
//!          │            Agent Executor           │
//!          │  model ⇄ tools, bounded, timed out  │
//!          └──────────────────┬──────────────────┘
//!                             ▼
//!                     ┌──────────────┐
//!                     │ Task Tracker │ ← pending → in_progress → done
//!                     └──────────────┘
//! ```

pub mod engine;
pub mod executor;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod sqlite;
pub mod streaming;
pub mod tools;
pub mod tracker;
pub mod worker;

pub use engine::{EngineOptions, TaskEngine, TaskResponse, TaskSubmission, build_client};
pub use executor::{AgentExecutor, ExecutionOutcome, ExecutionRequest, ExecutorConfig, ProgressSink};
pub use queue::{
    EnqueueOutcome, Job, JobBroker, JobPayload, JobProgress, JobState, MemoryJobBroker,
    QueueReceipt, QueueSubmission, TaskQueue,
};
pub use ratelimit::WindowLimiter;
pub use retry::RetryPolicy;
pub use sqlite::{SqliteJobBroker, SqliteTaskStore};
pub use streaming::{StreamHandle, run_streamed};
pub use tools::{CurrentTimeTool, EchoTool, builtin_registry};
pub use tracker::{MemoryTaskStore, TaskStore, TaskTracker};
pub use worker::{WorkerConfig, WorkerPool};
