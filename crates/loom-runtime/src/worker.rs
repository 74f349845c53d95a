//! # Worker Pool
//!
//! Consumes the task queue with at most `concurrency` jobs in flight and at
//! most `rate_limit_max` job starts per rolling window. Each job moves through
//! the progress markers `queued → starting → executing → finalizing → done`.
//!
//! A failed attempt is retried with exponential backoff while the error is
//! retryable and attempts remain. Once attempts are exhausted the task is
//! marked failed with the number of retries consumed, so a job that failed
//! all four attempts records `attempt_count = 3`.
//!
//! Delivery is at least once: a job interrupted by a crash runs again after
//! the broker recovers it, and its tools may see their side effects twice.
//! A job that was interrupted on its final attempt is failed instead of
//! running past its budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loom_config::schema::QueueConfig;
use loom_core::{ErrorEnvelope, LoomError, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::queue::{Job, JobProgress, TaskQueue};
use crate::ratelimit::WindowLimiter;

/// Pool sizing and pacing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    /// Idle wait between broker polls when nobody wakes the pool.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_queue(&QueueConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_queue(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            rate_limit_max: config.rate_limit_max.max(1),
            rate_limit_window: Duration::from_millis(config.rate_limit_window_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

/// Runs one job attempt at a time; cloned into every spawned job.
#[derive(Clone)]
struct JobRunner {
    queue: TaskQueue,
    executor: Arc<AgentExecutor>,
}

impl JobRunner {
    /// Run one reserved job to a broker outcome. Any error, from the
    /// execution or from the bookkeeping around it, goes through the same
    /// retry-or-fail path so the job never stays active.
    async fn run(&self, job: Job) {
        if let Err(e) = self.attempt(&job).await {
            if let Err(e) = self.after_failure(&job, e).await {
                error!(task_id = %job.id, error = %e, "failed to settle job after error");
            }
        }
    }

    async fn attempt(&self, job: &Job) -> Result<()> {
        let broker = self.queue.broker();
        let tracker = self.queue.tracker();
        let task_id = job.id.clone();

        // Recovered after a crash between the tracker write and the broker ack.
        let task = tracker.get(&task_id).await?;
        if task.status.is_terminal() {
            info!(task_id = %task_id, status = %task.status, "task already finished, acknowledging job");
            return broker.complete(&task_id).await;
        }
        if job.attempts_made > job.max_attempts {
            return Err(LoomError::Queue(format!(
                "job {} was interrupted on its final attempt",
                task_id
            )));
        }

        broker.set_progress(&task_id, JobProgress::Starting).await?;
        tracker.mark_running(&task_id).await?;
        broker.set_progress(&task_id, JobProgress::Executing).await?;

        let request = ExecutionRequest {
            task_id: task_id.clone(),
            owner_id: job.payload.owner_id.clone(),
            instruction: job.payload.instruction.clone(),
            conversation_id: job.payload.conversation_id.clone(),
            metadata: job.payload.metadata.clone(),
            attempt: job.attempts_made,
        };

        let outcome = self.executor.execute(&request, None).await?;
        broker.set_progress(&task_id, JobProgress::Finalizing).await?;
        tracker
            .mark_completed(&task_id, outcome.result.clone(), outcome.metadata(job.retries_used()))
            .await?;
        broker.complete(&task_id).await?;
        info!(task_id = %task_id, attempt = job.attempts_made, "job done");
        Ok(())
    }

    async fn after_failure(&self, job: &Job, err: LoomError) -> Result<()> {
        let envelope = ErrorEnvelope::from(&err);
        let broker = self.queue.broker();

        if err.is_retryable() && job.has_attempts_left() {
            let delay = self.queue.policy().delay_for(job.attempts_made);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            warn!(
                task_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = %envelope.code,
                "job attempt failed, scheduling retry"
            );
            broker.retry_at(&job.id, available_at, envelope).await?;

            let notify = self.queue.notifier();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                notify.notify_one();
            });
            return Ok(());
        }

        error!(
            task_id = %job.id,
            attempts = job.attempts_made,
            code = %envelope.code,
            error = %envelope.message,
            "job failed permanently"
        );
        let retries_used = job.retries_used().min(job.max_attempts.saturating_sub(1));
        broker.fail(&job.id, envelope.clone()).await?;
        self.queue
            .tracker()
            .mark_failed(&job.id, envelope, retries_used)
            .await?;
        Ok(())
    }
}

/// Pulls due jobs from the broker and runs them.
pub struct WorkerPool {
    runner: JobRunner,
    limiter: Arc<WindowLimiter>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, executor: Arc<AgentExecutor>, config: WorkerConfig) -> Self {
        let limiter = Arc::new(WindowLimiter::new(
            config.rate_limit_max,
            config.rate_limit_window,
        ));
        Self {
            runner: JobRunner { queue, executor },
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run on a background task until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Poll until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let notify = self.runner.queue.notifier();
        let mut running: JoinSet<()> = JoinSet::new();
        info!(
            concurrency = self.config.concurrency,
            rate_limit_max = self.config.rate_limit_max,
            "worker pool started"
        );

        loop {
            let permit: OwnedSemaphorePermit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    reap(joined);
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let job = match self.runner.queue.broker().reserve(Utc::now()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to reserve job");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            self.limiter.acquire().await;
            debug!(task_id = %job.id, attempt = job.attempts_made, "job reserved");

            let runner = self.runner.clone();
            running.spawn(async move {
                let _permit = permit;
                runner.run(job).await;
            });
        }

        info!(in_flight = running.len(), "worker pool draining");
        while let Some(joined) = running.join_next().await {
            reap(joined);
        }
        info!("worker pool stopped");
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job task panicked");
    }
}
