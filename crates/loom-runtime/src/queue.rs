//! # Task Queue
//!
//! Durable, at-least-once job delivery. A job wraps one task submission; its
//! id is the task id, so enqueueing the same explicit id again never creates
//! a second execution while the first one is known to the broker.
//!
//! Brokers hand out due jobs one at a time ([`JobBroker::reserve`]), count an
//! attempt on every reservation, and keep the retry schedule on the job
//! itself. The worker pool decides what to do with a failed attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_core::{ErrorEnvelope, LoomError, OwnerId, Result, TaskId, TaskStatus, new_task_id};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::retry::RetryPolicy;
use crate::tracker::TaskTracker;

/// What a queued job should execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub instruction: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Broker-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker, possibly not yet due.
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Coarse progress marker published by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobProgress {
    Queued,
    Starting,
    Executing,
    Finalizing,
    Done,
}

impl JobProgress {
    pub fn as_str(self) -> &'static str {
        match self {
            JobProgress::Queued => "queued",
            JobProgress::Starting => "starting",
            JobProgress::Executing => "executing",
            JobProgress::Finalizing => "finalizing",
            JobProgress::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobProgress::Queued),
            "starting" => Some(JobProgress::Starting),
            "executing" => Some(JobProgress::Executing),
            "finalizing" => Some(JobProgress::Finalizing),
            "done" => Some(JobProgress::Done),
            _ => None,
        }
    }
}

/// Queue unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Same as `payload.task_id`.
    pub id: TaskId,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far, the current one included.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: JobProgress,
    /// Not handed out before this instant.
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<ErrorEnvelope>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: payload.task_id.clone(),
            payload,
            state: JobState::Queued,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            progress: JobProgress::Queued,
            available_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Retries consumed so far: attempts after the first.
    pub fn retries_used(&self) -> u32 {
        self.attempts_made.saturating_sub(1)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// Result of [`JobBroker::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with this id is already known; nothing was added.
    Duplicate(JobState),
}

/// Durable queue broker.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Claim the oldest due queued job, mark it active and count the attempt.
    async fn reserve(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn set_progress(&self, job_id: &str, progress: JobProgress) -> Result<()>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Put an active job back, not to be handed out before `available_at`.
    async fn retry_at(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
        error: ErrorEnvelope,
    ) -> Result<()>;

    async fn fail(&self, job_id: &str, error: ErrorEnvelope) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;
}

/// Process-local broker. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryJobBroker {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| LoomError::NotFound(format!("job {}", job_id)))?;
        f(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobBroker for MemoryJobBroker {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(&job.id) {
            return Ok(EnqueueOutcome::Duplicate(existing.state));
        }
        jobs.insert(job.id.clone(), job);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn reserve(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        let next = jobs
            .values_mut()
            .filter(|j| j.state == JobState::Queued && j.available_at <= now)
            .min_by_key(|j| (j.available_at, j.created_at));
        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn set_progress(&self, job_id: &str, progress: JobProgress) -> Result<()> {
        self.update(job_id, |j| j.progress = progress)
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.update(job_id, |j| {
            j.state = JobState::Completed;
            j.progress = JobProgress::Done;
        })
    }

    async fn retry_at(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
        error: ErrorEnvelope,
    ) -> Result<()> {
        self.update(job_id, |j| {
            j.state = JobState::Queued;
            j.progress = JobProgress::Queued;
            j.available_at = available_at;
            j.last_error = Some(error);
        })
    }

    async fn fail(&self, job_id: &str, error: ErrorEnvelope) -> Result<()> {
        self.update(job_id, |j| {
            j.state = JobState::Failed;
            j.last_error = Some(error);
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }
}

/// Queue submission from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSubmission {
    pub instruction: String,
    pub owner_id: OwnerId,
    /// Becomes the task id; repeated submissions with the same key are
    /// collapsed into one job.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// "Accepted" answer to a queue submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReceipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// The id was already known and no new job was created.
    #[serde(default)]
    pub duplicate: bool,
}

/// Front-end tying the broker to the tracker.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn JobBroker>,
    tracker: TaskTracker,
    policy: RetryPolicy,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn JobBroker>, tracker: TaskTracker, policy: RetryPolicy) -> Self {
        Self {
            broker,
            tracker,
            policy,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wakes idle workers.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Record the task as Pending and enqueue it.
    pub async fn submit(&self, submission: QueueSubmission) -> Result<QueueReceipt> {
        let task_id = submission
            .idempotency_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(new_task_id);

        let task = self
            .tracker
            .create(&task_id, &submission.owner_id, &submission.instruction)
            .await?;
        if task.owner_id != submission.owner_id {
            return Err(LoomError::AlreadyExists(format!(
                "task {} belongs to another owner",
                task_id
            )));
        }

        let payload = JobPayload {
            task_id: task_id.clone(),
            owner_id: submission.owner_id,
            instruction: submission.instruction,
            conversation_id: submission.conversation_id,
            metadata: submission.metadata,
        };
        match self
            .broker
            .enqueue(Job::new(payload, self.policy.max_attempts()))
            .await?
        {
            EnqueueOutcome::Enqueued => {
                info!(task_id = %task_id, "job enqueued");
                self.notify.notify_one();
                Ok(QueueReceipt {
                    task_id,
                    status: TaskStatus::Pending,
                    duplicate: false,
                })
            }
            EnqueueOutcome::Duplicate(state) => {
                debug!(task_id = %task_id, state = state.as_str(), "duplicate job ignored");
                Ok(QueueReceipt {
                    task_id,
                    status: task.status,
                    duplicate: true,
                })
            }
        }
    }

    /// Broker view of a job: attempts, schedule, progress.
    pub async fn job(&self, task_id: &str) -> Result<Job> {
        self.broker
            .get(task_id)
            .await?
            .ok_or_else(|| LoomError::NotFound(format!("job {}", task_id)))
    }
}
