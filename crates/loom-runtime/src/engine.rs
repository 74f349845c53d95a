//! # Task Engine
//!
//! One handle over the three submission paths and the status query:
//!
//! - [`TaskEngine::run`]: synchronous, the caller waits for the result.
//! - [`TaskEngine::spawn_streamed`]: progress pushed to a channel while the
//!   task runs on its own tokio task.
//! - [`TaskEngine::enqueue`]: durable queue, executed later by a
//!   [`WorkerPool`] built with [`TaskEngine::worker_pool`].
//!
//! Every path records its task in the same [`TaskTracker`].

use std::sync::Arc;
use std::time::Duration;

use loom_config::LoomConfig;
use loom_config::schema::StoreBackend;
use loom_core::{
    ErrorEnvelope, LoomError, OwnerId, Result, StreamEvent, Task, TaskId, TaskMetadata,
    ToolRegistry, new_task_id,
};
use loom_llm::{AnthropicClient, CompletionClient};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::executor::{AgentExecutor, ExecutionOutcome, ExecutionRequest, ExecutorConfig};
use crate::queue::{Job, JobBroker, MemoryJobBroker, QueueReceipt, QueueSubmission, TaskQueue};
use crate::retry::RetryPolicy;
use crate::sqlite::{SqliteJobBroker, SqliteTaskStore};
use crate::streaming::{StreamHandle, run_streamed};
use crate::tracker::{MemoryTaskStore, TaskStore, TaskTracker};
use crate::worker::{WorkerConfig, WorkerPool};

/// A direct (synchronous or streamed) submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    pub instruction: String,
    pub owner_id: OwnerId,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TaskSubmission {
    pub fn new(owner_id: impl Into<OwnerId>, instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            owner_id: owner_id.into(),
            conversation_id: None,
            metadata: None,
        }
    }
}

/// Answer to a synchronous submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub result: String,
    pub metadata: TaskMetadata,
}

/// Knobs that are not part of the executor itself.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub heartbeat_interval: Duration,
    pub stream_buffer: usize,
    pub workers: WorkerConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&LoomConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &LoomConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.streaming.heartbeat_interval_secs.max(1)),
            stream_buffer: config.streaming.buffer.max(1),
            workers: WorkerConfig::from_queue(&config.queue),
        }
    }
}

#[derive(Clone)]
pub struct TaskEngine {
    executor: Arc<AgentExecutor>,
    tracker: TaskTracker,
    queue: TaskQueue,
    options: EngineOptions,
}

impl TaskEngine {
    pub fn new(
        executor: Arc<AgentExecutor>,
        tracker: TaskTracker,
        queue: TaskQueue,
        options: EngineOptions,
    ) -> Self {
        Self {
            executor,
            tracker,
            queue,
            options,
        }
    }

    /// Wire an engine from configuration, opening the configured stores.
    pub fn from_config(
        config: &LoomConfig,
        client: Arc<dyn CompletionClient>,
        tools: ToolRegistry,
    ) -> Result<Self> {
        let store: Arc<dyn TaskStore> = match config.tracker.backend {
            StoreBackend::Memory => Arc::new(MemoryTaskStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteTaskStore::open(&config.tracker.db_path)?),
        };
        let broker: Arc<dyn JobBroker> = match config.queue.backend {
            StoreBackend::Memory => Arc::new(MemoryJobBroker::new()),
            StoreBackend::Sqlite => Arc::new(SqliteJobBroker::open(&config.queue.db_path)?),
        };
        Ok(Self::assemble(config, client, tools, store, broker))
    }

    /// Engine with process-local stores, whatever the configured backends.
    pub fn in_memory(
        config: &LoomConfig,
        client: Arc<dyn CompletionClient>,
        tools: ToolRegistry,
    ) -> Self {
        Self::assemble(
            config,
            client,
            tools,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryJobBroker::new()),
        )
    }

    fn assemble(
        config: &LoomConfig,
        client: Arc<dyn CompletionClient>,
        tools: ToolRegistry,
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn JobBroker>,
    ) -> Self {
        let executor = Arc::new(AgentExecutor::new(
            client,
            Arc::new(tools),
            ExecutorConfig::from_agent(&config.agent),
        ));
        let tracker = TaskTracker::new(store);
        let queue = TaskQueue::new(broker, tracker.clone(), RetryPolicy::from_config(&config.queue));
        Self::new(executor, tracker, queue, EngineOptions::from_config(config))
    }

    pub fn executor(&self) -> &Arc<AgentExecutor> {
        &self.executor
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Execute and wait. The task is tracked like any other; a failure is
    /// recorded and returned.
    pub async fn run(&self, submission: TaskSubmission) -> Result<TaskResponse> {
        let request = self.start_direct(submission).await?;
        let result = self.executor.execute(&request, None).await;
        let recorded = record_direct(&self.tracker, &request.task_id, &result).await;
        let outcome = result?;
        recorded?;
        Ok(TaskResponse {
            task_id: request.task_id,
            metadata: outcome.metadata(0),
            result: outcome.result,
        })
    }

    /// Start a task whose events go to `sink`. Returns once the task is
    /// tracked; dropping the receiver does not stop the execution.
    pub async fn spawn_streamed(
        &self,
        submission: TaskSubmission,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<(TaskId, JoinHandle<()>)> {
        let request = self.start_direct(submission).await?;
        let task_id = request.task_id.clone();
        let handle = StreamHandle::attach(task_id.clone(), sink, self.options.heartbeat_interval);

        let engine = self.clone();
        let join = tokio::spawn(async move {
            let _ = run_streamed(
                &engine.executor,
                &engine.tracker,
                &request,
                &handle,
                engine.options.stream_buffer,
            )
            .await;
        });
        Ok((task_id, join))
    }

    pub async fn enqueue(&self, submission: QueueSubmission) -> Result<QueueReceipt> {
        self.queue.submit(submission).await
    }

    /// Current record of a task. With an owner, tasks of other owners are
    /// reported as not found.
    pub async fn status(&self, task_id: &str, owner_id: Option<&str>) -> Result<Task> {
        match owner_id {
            Some(owner) => self.tracker.get_for_owner(task_id, owner).await,
            None => self.tracker.get(task_id).await,
        }
    }

    pub async fn job(&self, task_id: &str) -> Result<Job> {
        self.queue.job(task_id).await
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            Arc::clone(&self.executor),
            self.options.workers.clone(),
        )
    }

    async fn start_direct(&self, submission: TaskSubmission) -> Result<ExecutionRequest> {
        let task_id = new_task_id();
        self.tracker
            .create(&task_id, &submission.owner_id, &submission.instruction)
            .await?;
        self.tracker.mark_running(&task_id).await?;
        Ok(ExecutionRequest {
            task_id,
            owner_id: submission.owner_id,
            instruction: submission.instruction,
            conversation_id: submission.conversation_id,
            metadata: submission.metadata,
            attempt: 1,
        })
    }
}

/// Tracker writes for a direct task are retried this many times.
const RECORD_ATTEMPTS: u32 = 3;

/// Write the outcome of a sync or streamed task. A failed write is retried
/// briefly; if it still fails the error is returned so the caller learns the
/// task was not recorded.
pub(crate) async fn record_direct(
    tracker: &TaskTracker,
    task_id: &str,
    result: &Result<ExecutionOutcome>,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        let written = match result {
            Ok(outcome) => {
                tracker
                    .mark_completed(task_id, outcome.result.clone(), outcome.metadata(0))
                    .await
            }
            Err(e) => tracker.mark_failed(task_id, ErrorEnvelope::from(e), 0).await,
        };
        match written {
            Ok(true) => {
                info!(task_id, "direct task recorded");
                return Ok(());
            }
            Ok(false) => {
                warn!(task_id, "direct task already had a terminal status");
                return Ok(());
            }
            Err(e) if attempt < RECORD_ATTEMPTS => {
                warn!(task_id, attempt, error = %e, "failed to record direct task outcome, retrying");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                error!(task_id, error = %e, "giving up recording direct task outcome");
                return Err(e);
            }
        }
    }
}

/// Completion client for the configured provider.
pub fn build_client(config: &LoomConfig) -> Result<Arc<dyn CompletionClient>> {
    let api_key = config.services.anthropic_api_key.clone().ok_or_else(|| {
        LoomError::Config("no Anthropic API key (set services.anthropic_api_key or ANTHROPIC_API_KEY)".into())
    })?;
    let mut client = AnthropicClient::new(api_key);
    if let Some(url) = &config.services.anthropic_base_url {
        client = client.with_base_url(url.clone());
    }
    Ok(Arc::new(client))
}
