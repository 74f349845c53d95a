//! SQLite-backed task store and job broker.
//!
//! Both share one connection style: WAL journal, one `Connection` behind a
//! mutex, timestamps stored as fixed-width RFC 3339 UTC text so they sort
//! lexically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use loom_core::{ErrorEnvelope, LoomError, Result, Task, TaskMetadata, TaskStatus};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::queue::{EnqueueOutcome, Job, JobBroker, JobPayload, JobProgress, JobState};
use crate::tracker::TaskStore;

fn store_err(e: impl std::fmt::Display) -> LoomError {
    LoomError::Store(e.to_string())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| store_err(format!("bad timestamp '{}': {}", s, e)))
}

fn open(path: &Path, schema: &str) -> Result<Connection> {
    let conn = Connection::open(path).map_err(store_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
        .map_err(store_err)?;
    conn.execute_batch(schema).map_err(store_err)?;
    Ok(conn)
}

// ── Tasks ──────────────────────────────────────────────────────

const TASKS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    instruction TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id, created_at);
";

const TASK_COLUMNS: &str = "task_id, owner_id, instruction, status, result, error, metadata, created_at, updated_at, completed_at";

type TaskRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
);

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn task_from_row(row: TaskRow) -> Result<Task> {
    let (task_id, owner_id, instruction, status, result, error, metadata, created, updated, completed) =
        row;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| store_err(format!("unknown task status '{}'", status)))?;
    let error: Option<ErrorEnvelope> = error.map(|e| serde_json::from_str(&e)).transpose()?;
    let metadata: TaskMetadata = serde_json::from_str(&metadata)?;
    Ok(Task {
        task_id,
        owner_id,
        instruction,
        status,
        result,
        error,
        metadata,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
        completed_at: completed.as_deref().map(parse_ts).transpose()?,
    })
}

/// Task records in a SQLite database.
pub struct SqliteTaskStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening task store");
        Ok(Self {
            db: Arc::new(Mutex::new(open(path, TASKS_SCHEMA)?)),
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<bool> {
        let error = task.error.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&task.metadata)?;
        let conn = self.db.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO tasks (task_id, owner_id, instruction, status, result, error, metadata, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.task_id,
                    task.owner_id,
                    task.instruction,
                    task.status.as_str(),
                    task.result,
                    error,
                    metadata,
                    ts(&task.created_at),
                    ts(&task.updated_at),
                    task.completed_at.as_ref().map(ts),
                ],
            )
            .map_err(store_err)?;
        Ok(inserted == 1)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = {
            let conn = self.db.lock();
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id],
                read_task_row,
            )
            .optional()
            .map_err(store_err)?
        };
        row.map(task_from_row).transpose()
    }

    async fn replace_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let error = task.error.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&task.metadata)?;
        let conn = self.db.lock();
        let updated = conn
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, error = ?3, metadata = ?4, updated_at = ?5, completed_at = ?6
                 WHERE task_id = ?7 AND status = ?8",
                params![
                    task.status.as_str(),
                    task.result,
                    error,
                    metadata,
                    ts(&task.updated_at),
                    task.completed_at.as_ref().map(ts),
                    task.task_id,
                    expected.as_str(),
                ],
            )
            .map_err(store_err)?;
        Ok(updated == 1)
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = {
            let conn = self.db.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM tasks WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    TASK_COLUMNS
                ))
                .map_err(store_err)?;
            stmt.query_map(params![owner_id, limit as i64], read_task_row)
                .map_err(store_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?
        };
        rows.into_iter().map(task_from_row).collect()
    }
}

// ── Jobs ───────────────────────────────────────────────────────

const JOBS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    progress TEXT NOT NULL,
    available_at TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, available_at);
";

const JOB_COLUMNS: &str =
    "id, payload, state, attempts_made, max_attempts, progress, available_at, last_error, created_at, updated_at";

type JobRow = (
    String,
    String,
    String,
    u32,
    u32,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn job_from_row(row: JobRow) -> Result<Job> {
    let (id, payload, state, attempts_made, max_attempts, progress, available, last_error, created, updated) =
        row;
    let payload: JobPayload = serde_json::from_str(&payload)?;
    Ok(Job {
        id,
        payload,
        state: JobState::parse(&state)
            .ok_or_else(|| store_err(format!("unknown job state '{}'", state)))?,
        attempts_made,
        max_attempts,
        progress: JobProgress::parse(&progress)
            .ok_or_else(|| store_err(format!("unknown job progress '{}'", progress)))?,
        available_at: parse_ts(&available)?,
        last_error: last_error.map(|e| serde_json::from_str(&e)).transpose()?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

/// Durable broker in a SQLite database.
pub struct SqliteJobBroker {
    db: Arc<Mutex<Connection>>,
}

impl SqliteJobBroker {
    /// Open the broker. Jobs left active by a previous process are queued
    /// again; the attempt they consumed stays counted.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening job broker");
        let conn = open(path, JOBS_SCHEMA)?;
        let recovered = conn
            .execute(
                "UPDATE jobs SET state = 'queued', progress = 'queued', updated_at = ?1 WHERE state = 'active'",
                params![ts(&Utc::now())],
            )
            .map_err(store_err)?;
        if recovered > 0 {
            warn!(recovered, "re-queued jobs interrupted by a previous shutdown");
        }
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn get_locked(conn: &Connection, job_id: &str) -> Result<Option<JobRow>> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![job_id],
            read_job_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn execute_on(&self, job_id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let conn = self.db.lock();
        let changed = conn.execute(sql, params).map_err(store_err)?;
        if changed == 0 {
            return Err(LoomError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl JobBroker for SqliteJobBroker {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let payload = serde_json::to_string(&job.payload)?;
        let conn = self.db.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs (id, payload, state, attempts_made, max_attempts, progress, available_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9)",
                params![
                    job.id,
                    payload,
                    job.state.as_str(),
                    job.attempts_made,
                    job.max_attempts,
                    job.progress.as_str(),
                    ts(&job.available_at),
                    ts(&job.created_at),
                    ts(&job.updated_at),
                ],
            )
            .map_err(store_err)?;
        if inserted == 1 {
            return Ok(EnqueueOutcome::Enqueued);
        }
        let state: String = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![job.id], |r| r.get(0))
            .map_err(store_err)?;
        let state = JobState::parse(&state)
            .ok_or_else(|| store_err(format!("unknown job state '{}'", state)))?;
        Ok(EnqueueOutcome::Duplicate(state))
    }

    async fn reserve(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = {
            let conn = self.db.lock();
            let next: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs WHERE state = 'queued' AND available_at <= ?1
                     ORDER BY available_at, created_at LIMIT 1",
                    params![ts(&now)],
                    |r| r.get(0),
                )
                .optional()
                .map_err(store_err)?;
            let Some(id) = next else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1, updated_at = ?1 WHERE id = ?2",
                params![ts(&now), id],
            )
            .map_err(store_err)?;
            Self::get_locked(&conn, &id)?
        };
        row.map(job_from_row).transpose()
    }

    async fn set_progress(&self, job_id: &str, progress: JobProgress) -> Result<()> {
        self.execute_on(
            job_id,
            "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3",
            params![progress.as_str(), ts(&Utc::now()), job_id],
        )
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.execute_on(
            job_id,
            "UPDATE jobs SET state = 'completed', progress = 'done', updated_at = ?1 WHERE id = ?2",
            params![ts(&Utc::now()), job_id],
        )
    }

    async fn retry_at(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
        error: ErrorEnvelope,
    ) -> Result<()> {
        let error = serde_json::to_string(&error)?;
        self.execute_on(
            job_id,
            "UPDATE jobs SET state = 'queued', progress = 'queued', available_at = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![ts(&available_at), error, ts(&Utc::now()), job_id],
        )
    }

    async fn fail(&self, job_id: &str, error: ErrorEnvelope) -> Result<()> {
        let error = serde_json::to_string(&error)?;
        self.execute_on(
            job_id,
            "UPDATE jobs SET state = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, ts(&Utc::now()), job_id],
        )
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = {
            let conn = self.db.lock();
            Self::get_locked(&conn, job_id)?
        };
        row.map(job_from_row).transpose()
    }
}
