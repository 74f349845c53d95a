#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use loom_config::LoomConfig;
    use loom_core::*;
    use loom_llm::{MockClient, StopReason};
    use loom_runtime::*;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    // ── Test tools ─────────────────────────────────────────────

    struct Categories;

    #[async_trait]
    impl ToolHandler for Categories {
        fn definition(&self) -> Tool {
            Tool {
                name: "list_categories".into(),
                description: "List the owner's categories".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn invoke(&self, _input: Value, ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(format!(
                "{{\"owner\":\"{}\",\"categories\":[\"groceries\",\"rent\"]}}",
                ctx.owner_id
            )))
        }
    }

    /// Sleeps for `input.ms` then echoes `input.tag`.
    struct Sleepy;

    #[async_trait]
    impl ToolHandler for Sleepy {
        fn definition(&self) -> Tool {
            Tool {
                name: "sleepy".into(),
                description: "Sleep then answer".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutput::ok(input["tag"].as_str().unwrap_or("").to_string()))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with(Categories).with(Sleepy)
    }

    fn executor(client: &MockClient, config: ExecutorConfig) -> AgentExecutor {
        AgentExecutor::new(Arc::new(client.clone()), Arc::new(registry()), config)
    }

    fn config(max_iterations: u32, timeout: Duration) -> ExecutorConfig {
        ExecutorConfig {
            max_iterations,
            timeout,
            ..Default::default()
        }
    }

    fn tool_messages(request: &loom_llm::LlmRequest) -> Vec<(String, String, bool)> {
        request
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|c| match c {
                MessageContent::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                } => Some((tool_call_id.clone(), content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    // ── Loop ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let client = MockClient::new()
            .with_tool_call("list_categories", json!({}))
            .with_response("You have groceries and rent.");
        let exec = executor(&client, config(20, Duration::from_secs(5)));

        let out = exec
            .execute(&ExecutionRequest::new("t1", "alice", "list categories"), None)
            .await
            .unwrap();
        assert_eq!(out.result, "You have groceries and rent.");
        assert_eq!(out.iterations, 1);
        assert!(out.tools_used >= 1);
        assert_eq!(out.stop_reason, StopReason::EndTurn);
        assert_eq!(client.call_count(), 2);

        // The tool saw the bound owner, and the second call carried its output.
        let requests = client.recorded_requests();
        let outcomes = tool_messages(&requests[1]);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.contains("\"owner\":\"alice\""));
        assert!(!outcomes[0].2);
        assert_eq!(requests[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_absorbed() {
        let client = MockClient::new()
            .with_tool_call("delete_everything", json!({}))
            .with_response("I can't do that.");
        let exec = executor(&client, config(20, Duration::from_secs(5)));

        let out = exec
            .execute(&ExecutionRequest::new("t1", "alice", "go"), None)
            .await
            .unwrap();
        assert_eq!(out.result, "I can't do that.");

        let outcomes = tool_messages(&client.recorded_requests()[1]);
        assert!(outcomes[0].2);
        assert!(outcomes[0].1.contains("tool not found"));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let client = MockClient::new().always_tool_call("list_categories", json!({}));
        let exec = executor(&client, config(2, Duration::from_secs(5)));

        let err = exec
            .execute(&ExecutionRequest::new("t1", "alice", "loop forever"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::IterationLimitExceeded { max: 2 }));
        assert_eq!(err.code(), "ITERATION_LIMIT_EXCEEDED");
        // Two tool rounds, then the call that would have started a third.
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout() {
        let client = MockClient::new()
            .with_response("too slow")
            .with_delay(Duration::from_millis(500));
        let exec = executor(&client, config(20, Duration::from_millis(50)));

        let err = exec
            .execute(&ExecutionRequest::new("t1", "alice", "go"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::Timeout { after_ms: 50 }));
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_max_tokens_returns_partial_text() {
        let client = MockClient::new().with_max_tokens("The categories are gro");
        let exec = executor(&client, config(20, Duration::from_secs(5)));

        let out = exec
            .execute(&ExecutionRequest::new("t1", "alice", "go"), None)
            .await
            .unwrap();
        assert_eq!(out.result, "The categories are gro");
        assert_eq!(out.stop_reason, StopReason::MaxTokens);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_parallel_outcomes_keep_request_order() {
        let client = MockClient::new()
            .with_tool_calls(vec![
                ("sleepy", json!({"ms": 80, "tag": "first"})),
                ("sleepy", json!({"ms": 0, "tag": "second"})),
                ("sleepy", json!({"ms": 30, "tag": "third"})),
            ])
            .with_response("done");
        let exec = executor(
            &client,
            ExecutorConfig {
                max_parallel_tools: 3,
                ..config(20, Duration::from_secs(5))
            },
        );

        let out = exec
            .execute(&ExecutionRequest::new("t1", "alice", "go"), None)
            .await
            .unwrap();
        assert_eq!(out.tools_used, 3);
        assert_eq!(out.iterations, 1);

        let outcomes = tool_messages(&client.recorded_requests()[1]);
        let tags: Vec<&str> = outcomes.iter().map(|o| o.1.as_str()).collect();
        assert_eq!(tags, vec!["first", "second", "third"]);
        assert!(outcomes[0].0.starts_with("call_0_"));
        assert!(outcomes[2].0.starts_with("call_2_"));
    }

    #[tokio::test]
    async fn test_parallel_completion_events_follow_request_order() {
        let client = MockClient::new()
            .with_tool_calls(vec![
                ("sleepy", json!({"ms": 80, "tag": "first"})),
                ("sleepy", json!({"ms": 0, "tag": "second"})),
                ("sleepy", json!({"ms": 30, "tag": "third"})),
            ])
            .with_response("done");
        let exec = executor(
            &client,
            ExecutorConfig {
                max_parallel_tools: 3,
                ..config(20, Duration::from_secs(5))
            },
        );
        let (tx, mut rx) = mpsc::channel(32);

        exec.execute(&ExecutionRequest::new("t1", "alice", "go"), Some(tx))
            .await
            .unwrap();

        let mut completed = vec![];
        while let Some(ev) = rx.recv().await {
            if let ExecutionEvent::ToolCompleted { tool_call_id, .. } = ev {
                completed.push(tool_call_id);
            }
        }
        assert_eq!(completed.len(), 3);
        assert!(completed[0].starts_with("call_0_"));
        assert!(completed[1].starts_with("call_1_"));
        assert!(completed[2].starts_with("call_2_"));
    }

    #[tokio::test]
    async fn test_events_reach_progress_sink() {
        let client = MockClient::new()
            .with_tool_call("list_categories", json!({}))
            .with_response("ok");
        let exec = executor(&client, config(20, Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::channel(32);

        exec.execute(&ExecutionRequest::new("t1", "alice", "go"), Some(tx))
            .await
            .unwrap();

        let mut events = vec![];
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(
            events[0],
            ExecutionEvent::IterationStarted { iteration: 1, .. }
        ));
        assert!(matches!(events[1], ExecutionEvent::ToolRequested { .. }));
        assert!(matches!(
            events[2],
            ExecutionEvent::ToolCompleted { is_error: false, .. }
        ));
    }

    // ── Streaming through the engine ───────────────────────────

    fn engine(client: &MockClient, max_iterations: u32) -> TaskEngine {
        let mut config = LoomConfig::default();
        config.agent.max_iterations = max_iterations;
        config.agent.timeout_secs = 5;
        TaskEngine::in_memory(&config, Arc::new(client.clone()), registry())
    }

    /// Memory store whose next `fail_writes` terminal status writes fail.
    struct FlakyStore {
        inner: MemoryTaskStore,
        fail_writes: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(fail_writes: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryTaskStore::new(),
                fail_writes: AtomicUsize::new(fail_writes),
            })
        }
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
            if task.status.is_terminal()
                && self
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

    fn engine_with_store(client: &MockClient, store: Arc<dyn TaskStore>) -> TaskEngine {
        let mut config = LoomConfig::default();
        config.agent.timeout_secs = 5;
        let executor = Arc::new(AgentExecutor::new(
            Arc::new(client.clone()),
            Arc::new(registry()),
            ExecutorConfig::from_agent(&config.agent),
        ));
        let tracker = TaskTracker::new(store);
        let queue = TaskQueue::new(
            Arc::new(MemoryJobBroker::new()),
            tracker.clone(),
            RetryPolicy::from_config(&config.queue),
        );
        TaskEngine::new(executor, tracker, queue, EngineOptions::from_config(&config))
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = vec![];
        while let Some(ev) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_stream_event_order() {
        let client = MockClient::new()
            .with_tool_call("list_categories", json!({}))
            .with_response("groceries, rent");
        let engine = engine(&client, 20);
        let (tx, rx) = mpsc::channel(64);

        let (task_id, join) = engine
            .spawn_streamed(TaskSubmission::new("alice", "list categories"), tx)
            .await
            .unwrap();
        let events = drain(rx).await;
        join.await.unwrap();

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| e.kind())
            .filter(|k| *k != "heartbeat")
            .collect();
        assert_eq!(kinds.first(), Some(&"progress"));
        assert_eq!(kinds.last(), Some(&"complete"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(kinds.contains(&"tool_use"));

        match &events.last().unwrap().payload {
            StreamPayload::Complete {
                task_id: id,
                result,
                metadata,
            } => {
                assert_eq!(id, &task_id);
                assert_eq!(result, "groceries, rent");
                assert_eq!(metadata.iterations, 1);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }

        let task = engine.status(&task_id, Some("alice")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_stream_failure_ends_with_error_event() {
        let client = MockClient::new().always_tool_call("list_categories", json!({}));
        let engine = engine(&client, 1);
        let (tx, rx) = mpsc::channel(64);

        let (task_id, join) = engine
            .spawn_streamed(TaskSubmission::new("alice", "loop"), tx)
            .await
            .unwrap();
        let events = drain(rx).await;
        join.await.unwrap();

        match &events.last().unwrap().payload {
            StreamPayload::Error { code, .. } => assert_eq!(code, "ITERATION_LIMIT_EXCEEDED"),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let task = engine.status(&task_id, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().code, "ITERATION_LIMIT_EXCEEDED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_status_is_final_once_terminal_event_arrives() {
        for _ in 0..50 {
            let client = MockClient::new().with_response("done");
            let engine = engine(&client, 20);
            let (tx, mut rx) = mpsc::channel(64);

            let (task_id, _join) = engine
                .spawn_streamed(TaskSubmission::new("alice", "go"), tx)
                .await
                .unwrap();
            let terminal = loop {
                let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if ev.is_terminal() {
                    break ev;
                }
            };
            assert_eq!(terminal.kind(), "complete");

            let task = engine.status(&task_id, None).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_stream_unrecorded_outcome_ends_with_error_event() {
        let client = MockClient::new().with_response("done");
        let engine = engine_with_store(&client, FlakyStore::failing(10));
        let (tx, rx) = mpsc::channel(64);

        let (_task_id, join) = engine
            .spawn_streamed(TaskSubmission::new("alice", "go"), tx)
            .await
            .unwrap();
        let events = drain(rx).await;
        join.await.unwrap();

        match &events.last().unwrap().payload {
            StreamPayload::Error { code, .. } => assert_eq!(code, "STORE_ERROR"),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_stream_disconnect_does_not_cancel_task() {
        let client = MockClient::new()
            .with_tool_call("sleepy", json!({"ms": 50, "tag": "x"}))
            .with_response("finished anyway");
        let engine = engine(&client, 20);
        let (tx, rx) = mpsc::channel(64);

        let (task_id, join) = engine
            .spawn_streamed(TaskSubmission::new("alice", "go"), tx)
            .await
            .unwrap();
        drop(rx);
        join.await.unwrap();

        let task = engine.status(&task_id, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("finished anyway"));
    }

    // ── Synchronous path ───────────────────────────────────────

    #[tokio::test]
    async fn test_sync_run_is_tracked() {
        let client = MockClient::new().with_response("42");
        let engine = engine(&client, 20);

        let resp = engine.run(TaskSubmission::new("alice", "answer")).await.unwrap();
        assert_eq!(resp.result, "42");
        assert_eq!(resp.metadata.iterations, 1);
        assert_eq!(resp.metadata.attempt_count, 0);

        let task = engine.status(&resp.task_id, Some("alice")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            engine.status(&resp.task_id, Some("bob")).await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_sync_failure_is_recorded() {
        let client = MockClient::new().with_error("HTTP 500");
        let engine = engine(&client, 20);

        let err = engine.run(TaskSubmission::new("alice", "go")).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");

        let tasks = engine.tracker().list_for_owner("alice", 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_sync_record_retries_transient_store_error() {
        let client = MockClient::new().with_response("42");
        let engine = engine_with_store(&client, FlakyStore::failing(1));

        let resp = engine.run(TaskSubmission::new("alice", "answer")).await.unwrap();
        let task = engine.status(&resp.task_id, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_sync_unrecorded_outcome_is_surfaced() {
        let client = MockClient::new().with_response("42");
        let engine = engine_with_store(&client, FlakyStore::failing(10));

        let err = engine.run(TaskSubmission::new("alice", "answer")).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
    }
}
