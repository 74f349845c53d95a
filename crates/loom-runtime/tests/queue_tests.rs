#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use loom_config::LoomConfig;
    use loom_config::schema::StoreBackend;
    use loom_core::*;
    use loom_llm::{CompletionClient, LlmRequest, LlmResponse, MockClient, StopReason, Usage};
    use loom_runtime::*;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    fn fast_config() -> LoomConfig {
        let mut config = LoomConfig::default();
        config.agent.timeout_secs = 5;
        config.queue.backoff_base_ms = 5;
        config.queue.backoff_max_ms = 20;
        config.queue.poll_interval_ms = 10;
        config
    }

    fn submission(owner: &str, key: Option<&str>) -> QueueSubmission {
        QueueSubmission {
            instruction: "summarise my spending".into(),
            owner_id: owner.into(),
            idempotency_key: key.map(String::from),
            conversation_id: None,
            metadata: None,
        }
    }

    async fn wait_terminal(engine: &TaskEngine, task_id: &str) -> Task {
        for _ in 0..500 {
            let task = engine.status(task_id, None).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    /// Completion client that records when calls start and how many overlap.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        starts: Mutex<Vec<tokio::time::Instant>>,
        hold: Duration,
    }

    #[async_trait]
    impl CompletionClient for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
            self.starts.lock().push(tokio::time::Instant::now());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(LlmResponse {
                message: Message::text(Role::Assistant, "ok"),
                usage: Usage::default(),
                has_tool_calls: false,
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    /// Memory store whose next `fail_writes` status writes fail.
    struct FlakyStore {
        inner: MemoryTaskStore,
        fail_writes: AtomicUsize,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn insert(&self, task: &Task) -> Result<bool> {
            self.inner.insert(task).await
        }

        async fn get(&self, task_id: &str) -> Result<Option<Task>> {
            self.inner.get(task_id).await
        }

        async fn replace_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
            if self
                .fail_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LoomError::Store("database is locked".into()));
            }
            self.inner.replace_if_status(task, expected).await
        }

        async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Task>> {
            self.inner.list_by_owner(owner_id, limit).await
        }
    }

    fn sqlite_config(dir: &std::path::Path) -> LoomConfig {
        let mut config = fast_config();
        config.queue.backend = StoreBackend::Sqlite;
        config.queue.db_path = dir.join("loom.db");
        config.tracker.backend = StoreBackend::Sqlite;
        config.tracker.db_path = dir.join("loom.db");
        config
    }

    // ── Retries ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_attempt_count() {
        let client = MockClient::new().always_error("HTTP 500");
        let engine = TaskEngine::in_memory(&fast_config(), Arc::new(client.clone()), ToolRegistry::new());
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let receipt = engine.enqueue(submission("alice", None)).await.unwrap();
        assert_eq!(receipt.status, TaskStatus::Pending);
        assert!(!receipt.duplicate);

        let task = wait_terminal(&engine, &receipt.task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.metadata.attempt_count, 3);
        assert_eq!(task.error.unwrap().code, "EXECUTION_ERROR");
        assert_eq!(client.call_count(), 4);

        let job = engine.job(&receipt.task_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 4);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let client = MockClient::new().with_error("HTTP 502").with_response("recovered");
        let engine = TaskEngine::in_memory(&fast_config(), Arc::new(client.clone()), ToolRegistry::new());
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let receipt = engine.enqueue(submission("alice", None)).await.unwrap();
        let task = wait_terminal(&engine, &receipt.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("recovered"));
        assert_eq!(task.metadata.attempt_count, 1);
        assert_eq!(client.call_count(), 2);

        let job = engine.job(&receipt.task_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, JobProgress::Done);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_retries_fails_after_one_attempt() {
        let mut config = fast_config();
        config.queue.max_retries = 0;
        let client = MockClient::new().always_error("HTTP 500");
        let engine = TaskEngine::in_memory(&config, Arc::new(client.clone()), ToolRegistry::new());
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let receipt = engine.enqueue(submission("alice", None)).await.unwrap();
        let task = wait_terminal(&engine, &receipt.task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.metadata.attempt_count, 0);
        assert_eq!(client.call_count(), 1);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_bookkeeping_error_is_retried() {
        let config = fast_config();
        let client = MockClient::new().with_response("made it");
        let executor = Arc::new(AgentExecutor::new(
            Arc::new(client.clone()),
            Arc::new(ToolRegistry::new()),
            ExecutorConfig::from_agent(&config.agent),
        ));
        let tracker = TaskTracker::new(Arc::new(FlakyStore {
            inner: MemoryTaskStore::new(),
            fail_writes: AtomicUsize::new(1),
        }));
        let queue = TaskQueue::new(
            Arc::new(MemoryJobBroker::new()),
            tracker.clone(),
            RetryPolicy::from_config(&config.queue),
        );
        let engine = TaskEngine::new(executor, tracker, queue, EngineOptions::from_config(&config));
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let receipt = engine.enqueue(submission("alice", None)).await.unwrap();
        let task = wait_terminal(&engine, &receipt.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.metadata.attempt_count, 1);
        assert_eq!(client.call_count(), 1);

        let job = engine.job(&receipt.task_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 2);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_job_interrupted_on_final_attempt_is_failed_after_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(dir.path());
        {
            let engine =
                TaskEngine::from_config(&config, Arc::new(MockClient::new()), ToolRegistry::new())
                    .unwrap();
            engine.enqueue(submission("alice", Some("crashy"))).await.unwrap();
            let broker = engine.queue().broker();
            for attempt in 1..=4 {
                let job = broker.reserve(Utc::now()).await.unwrap().unwrap();
                assert_eq!(job.attempts_made, attempt);
                if attempt < 4 {
                    broker
                        .retry_at("crashy", Utc::now(), ErrorEnvelope::new("TIMEOUT", "slow"))
                        .await
                        .unwrap();
                }
            }
            // Dropped while the last attempt is still active.
        }

        let client = MockClient::new().with_response("must not run");
        let engine =
            TaskEngine::from_config(&config, Arc::new(client.clone()), ToolRegistry::new()).unwrap();
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let task = wait_terminal(&engine, "crashy").await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.metadata.attempt_count, 3);
        assert_eq!(task.error.unwrap().code, "QUEUE_ERROR");
        assert_eq!(client.call_count(), 0);
        assert_eq!(engine.job("crashy").await.unwrap().state, JobState::Failed);

        shutdown.cancel();
        workers.await.unwrap();
    }

    // ── Idempotency ────────────────────────────────────────────

    #[tokio::test]
    async fn test_duplicate_submission_runs_once() {
        let client = MockClient::new().with_response("once");
        let engine = TaskEngine::in_memory(&fast_config(), Arc::new(client.clone()), ToolRegistry::new());

        let first = engine.enqueue(submission("alice", Some("req-1"))).await.unwrap();
        let second = engine.enqueue(submission("alice", Some("req-1"))).await.unwrap();
        assert_eq!(first.task_id, "req-1");
        assert_eq!(second.task_id, "req-1");
        assert!(second.duplicate);

        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());
        let task = wait_terminal(&engine, "req-1").await;
        assert_eq!(task.status, TaskStatus::Completed);

        let third = engine.enqueue(submission("alice", Some("req-1"))).await.unwrap();
        assert!(third.duplicate);
        assert_eq!(third.status, TaskStatus::Completed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.call_count(), 1);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_key_reuse_by_other_owner_is_rejected() {
        let engine = TaskEngine::in_memory(
            &fast_config(),
            Arc::new(MockClient::new()),
            ToolRegistry::new(),
        );
        engine.enqueue(submission("alice", Some("req-1"))).await.unwrap();
        let err = engine
            .enqueue(submission("bob", Some("req-1")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    // ── Pacing ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut config = fast_config();
        config.queue.concurrency = 2;
        config.queue.rate_limit_max = 100;
        let gauge = Arc::new(Gauge {
            hold: Duration::from_millis(60),
            ..Default::default()
        });
        let engine = TaskEngine::in_memory(&config, gauge.clone(), ToolRegistry::new());

        let mut ids = vec![];
        for _ in 0..6 {
            ids.push(engine.enqueue(submission("alice", None)).await.unwrap().task_id);
        }
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());
        for id in &ids {
            assert_eq!(wait_terminal(&engine, id).await.status, TaskStatus::Completed);
        }

        assert_eq!(gauge.starts.lock().len(), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);

        shutdown.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_job_starts() {
        let mut config = fast_config();
        config.queue.concurrency = 5;
        config.queue.rate_limit_max = 2;
        config.queue.rate_limit_window_ms = 300;
        let gauge = Arc::new(Gauge::default());
        let engine = TaskEngine::in_memory(&config, gauge.clone(), ToolRegistry::new());

        let mut ids = vec![];
        for _ in 0..3 {
            ids.push(engine.enqueue(submission("alice", None)).await.unwrap().task_id);
        }
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());
        for id in &ids {
            wait_terminal(&engine, id).await;
        }

        let starts = gauge.starts.lock().clone();
        assert_eq!(starts.len(), 3);
        assert!(starts[2].duration_since(starts[0]) >= Duration::from_millis(250));

        shutdown.cancel();
        workers.await.unwrap();
    }

    // ── Durable backends ───────────────────────────────────────

    #[tokio::test]
    async fn test_sqlite_engine_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(dir.path());

        let client = MockClient::new().with_response("persisted");
        let engine = TaskEngine::from_config(&config, Arc::new(client), ToolRegistry::new()).unwrap();
        let shutdown = CancellationToken::new();
        let workers = engine.worker_pool().spawn(shutdown.clone());

        let receipt = engine.enqueue(submission("alice", Some("durable-1"))).await.unwrap();
        let task = wait_terminal(&engine, &receipt.task_id).await;
        assert_eq!(task.result.as_deref(), Some("persisted"));

        shutdown.cancel();
        workers.await.unwrap();

        let reopened =
            TaskEngine::from_config(&config, Arc::new(MockClient::new()), ToolRegistry::new()).unwrap();
        let task = reopened.status("durable-1", Some("alice")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(reopened.job("durable-1").await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_task_status() {
        let engine = TaskEngine::in_memory(
            &fast_config(),
            Arc::new(MockClient::new()),
            ToolRegistry::new(),
        );
        assert_eq!(engine.status("ghost", None).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(engine.job("ghost").await.unwrap_err().code(), "NOT_FOUND");
    }
}
