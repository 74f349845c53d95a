//! # Task Tracker
//!
//! Persists task status transitions so the direct paths, the queued path and
//! external pollers all observe one lifecycle. Status only moves forward and
//! the first terminal outcome wins: later `mark_*` calls are no-ops that
//! return `Ok(false)`.
//!
//! Durable state lives behind [`TaskStore`]; transitions are applied with a
//! compare-and-swap on the stored status so concurrent writers cannot move a
//! task backwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loom_core::{ErrorEnvelope, LoomError, Result, Task, TaskMetadata, TaskStatus};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Backing store for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Returns `false` if the id already exists.
    async fn insert(&self, task: &Task) -> Result<bool>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Replace the record only if its stored status is still `expected`.
    async fn replace_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool>;

    /// An owner's tasks, newest first.
    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Task>>;
}

/// Process-local store, for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task.task_id) {
            return Ok(false);
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(true)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn replace_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&task.task_id) {
            Some(current) if current.status == expected => {
                *current = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Task>> {
        let mut owned: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }
}

/// Lifecycle front-end over a [`TaskStore`].
#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn TaskStore>,
}

/// Concurrent writers retry a lost compare-and-swap this many times.
const MAX_CAS_ATTEMPTS: usize = 8;

impl TaskTracker {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTaskStore::new()))
    }

    /// Create a Pending task. A duplicate id is a benign no-op that returns
    /// the stored record.
    pub async fn create(&self, task_id: &str, owner_id: &str, instruction: &str) -> Result<Task> {
        let task = Task::new(task_id, owner_id, instruction);
        if self.store.insert(&task).await? {
            info!(task_id, owner_id, "task created");
            return Ok(task);
        }
        debug!(task_id, "task already exists, create is a no-op");
        self.get(task_id).await
    }

    pub async fn mark_running(&self, task_id: &str) -> Result<bool> {
        self.transition(task_id, TaskStatus::InProgress, |_| {}).await
    }

    pub async fn mark_completed(
        &self,
        task_id: &str,
        result: String,
        metadata: TaskMetadata,
    ) -> Result<bool> {
        self.transition(task_id, TaskStatus::Completed, move |task| {
            task.result = Some(result.clone());
            task.metadata = metadata.clone();
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        task_id: &str,
        error: ErrorEnvelope,
        attempt_count: u32,
    ) -> Result<bool> {
        self.transition(task_id, TaskStatus::Failed, move |task| {
            task.error = Some(error.clone());
            task.metadata.attempt_count = attempt_count;
        })
        .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| LoomError::NotFound(format!("task {}", task_id)))
    }

    /// Like [`get`](Self::get), but a task owned by someone else is reported
    /// as not found.
    pub async fn get_for_owner(&self, task_id: &str, owner_id: &str) -> Result<Task> {
        let task = self.get(task_id).await?;
        if task.owner_id != owner_id {
            return Err(LoomError::NotFound(format!("task {}", task_id)));
        }
        Ok(task)
    }

    pub async fn list_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Task>> {
        self.store.list_by_owner(owner_id, limit).await
    }

    async fn transition(
        &self,
        task_id: &str,
        next: TaskStatus,
        apply: impl Fn(&mut Task),
    ) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(task_id).await?;
            if !current.status.can_transition_to(next) {
                debug!(task_id, from = %current.status, to = %next, "transition skipped");
                return Ok(false);
            }

            let mut updated = current.clone();
            let now = Utc::now();
            updated.status = next;
            updated.updated_at = now;
            if next.is_terminal() {
                updated.completed_at = Some(now);
            }
            apply(&mut updated);

            if self.store.replace_if_status(&updated, current.status).await? {
                info!(task_id, from = %current.status, to = %next, "task status changed");
                return Ok(true);
            }
        }
        warn!(task_id, to = %next, "gave up on contended status transition");
        Err(LoomError::Store(format!(
            "task {} kept changing while moving to {}",
            task_id, next
        )))
    }
}
