//! # Agent Executor
//!
//! Runs the bounded tool-calling loop for one task:
//!
//! 1. Bind `owner_id`/`task_id` into a [`ToolContext`] and seed the
//!    conversation with the instruction.
//! 2. Call the model with the full conversation and every declared tool.
//! 3. No tool requested → the concatenated text is the result. A max-tokens
//!    stop also ends the loop with the text produced so far.
//! 4. Tools requested → dispatch them (bounded fan-out, outcomes appended in
//!    request order) and go round again.
//! 5. Still requesting tools after `max_iterations` rounds →
//!    [`LoomError::IterationLimitExceeded`].
//!
//! The whole loop races a wall-clock deadline; losing the race drops the
//! in-flight model or tool call and yields [`LoomError::Timeout`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use loom_config::schema::AgentConfig;
use loom_core::{
    Conversation, ExecutionEvent, LoomError, Message, OwnerId, Result, TaskId, TaskMetadata,
    TokenUsage, ToolCall, ToolContext, ToolOutcome, ToolRegistry,
};
use loom_llm::{CompletionClient, LlmRequest, StopReason};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Channel the executor pushes lifecycle events into.
pub type ProgressSink = mpsc::Sender<ExecutionEvent>;

/// Tunables for the loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub max_parallel_tools: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_agent(&AgentConfig::default())
    }
}

impl ExecutorConfig {
    pub fn from_agent(agent: &AgentConfig) -> Self {
        Self {
            model: agent.model.clone(),
            system_prompt: agent.system_prompt.clone(),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            max_iterations: agent.max_iterations,
            timeout: Duration::from_secs(agent.timeout_secs),
            max_parallel_tools: agent.max_parallel_tools.max(1),
        }
    }
}

/// Input to one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub instruction: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// 1-based attempt number, forwarded to tools.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl ExecutionRequest {
    pub fn new(
        task_id: impl Into<TaskId>,
        owner_id: impl Into<OwnerId>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            instruction: instruction.into(),
            conversation_id: None,
            metadata: None,
            attempt: 1,
        }
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: String,
    pub tools_used: u32,
    pub iterations: u32,
    pub duration_ms: u64,
    pub token_usage: TokenUsage,
    /// Why the last model call stopped.
    pub stop_reason: StopReason,
}

impl ExecutionOutcome {
    pub fn metadata(&self, attempt_count: u32) -> TaskMetadata {
        TaskMetadata {
            tools_used: self.tools_used,
            iterations: self.iterations,
            duration_ms: self.duration_ms,
            token_usage: self.token_usage,
            attempt_count,
        }
    }
}

/// Mediates between the completion client and the tool registry.
pub struct AgentExecutor {
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tools: Arc<ToolRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            client,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run one task to completion, timeout, or failure. Only
    /// `Timeout`, `IterationLimitExceeded`, and `Execution` errors escape.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        sink: Option<ProgressSink>,
    ) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        info!(
            task_id = %request.task_id,
            owner_id = %request.owner_id,
            attempt = request.attempt,
            "execution started"
        );

        let result = match tokio::time::timeout(
            self.config.timeout,
            self.run_loop(request, sink, started),
        )
        .await
        {
            Ok(result) => result.map_err(LoomError::into_task_error),
            Err(_) => Err(LoomError::Timeout {
                after_ms: self.config.timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(outcome) => info!(
                task_id = %request.task_id,
                iterations = outcome.iterations,
                tools_used = outcome.tools_used,
                duration_ms = outcome.duration_ms,
                "execution finished"
            ),
            Err(e) => warn!(
                task_id = %request.task_id,
                code = e.code(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "execution failed"
            ),
        }
        result
    }

    async fn run_loop(
        &self,
        request: &ExecutionRequest,
        sink: Option<ProgressSink>,
        started: Instant,
    ) -> Result<ExecutionOutcome> {
        let ctx = ToolContext::new(request.owner_id.clone(), request.task_id.clone())
            .with_attempt(request.attempt);
        let mut conversation = Conversation::seeded(request.instruction.clone());
        let definitions = self.tools.definitions();
        let max_iterations = self.config.max_iterations;

        let mut usage = TokenUsage::default();
        let mut tools_used = 0u32;
        let mut rounds = 0u32;

        loop {
            let llm_request = LlmRequest {
                model: self.config.model.clone(),
                messages: conversation.messages().to_vec(),
                tools: definitions.clone(),
                system: self.config.system_prompt.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };

            let response = self.client.complete(&llm_request).await?;
            usage.add(
                response.usage.input_tokens as u64,
                response.usage.output_tokens as u64,
            );
            let text = response.message.text_content();

            let finished = |stop_reason| ExecutionOutcome {
                result: text.clone(),
                tools_used,
                iterations: rounds.max(1),
                duration_ms: started.elapsed().as_millis() as u64,
                token_usage: usage,
                stop_reason,
            };

            if response.stop_reason == StopReason::MaxTokens {
                info!(task_id = %request.task_id, rounds, "model hit max_tokens, returning partial result");
                return Ok(finished(StopReason::MaxTokens));
            }
            if !response.has_tool_calls {
                return Ok(finished(response.stop_reason));
            }
            if rounds >= max_iterations {
                warn!(task_id = %request.task_id, max_iterations, "max agent iterations reached");
                return Err(LoomError::IterationLimitExceeded {
                    max: max_iterations,
                });
            }

            rounds += 1;
            emit(
                &sink,
                ExecutionEvent::IterationStarted {
                    iteration: rounds,
                    max_iterations,
                },
            )
            .await;
            if !text.is_empty() {
                emit(&sink, ExecutionEvent::Thinking { text: text.clone() }).await;
            }

            let calls = response.message.tool_calls.clone();
            conversation.push(response.message);

            let outcomes = self.dispatch_all(&calls, &ctx, &sink).await;
            tools_used += calls.len() as u32;
            for outcome in &outcomes {
                conversation.push(Message::tool_outcome(outcome));
            }
            debug!(task_id = %request.task_id, round = rounds, calls = calls.len(), "tool round finished");
        }
    }

    /// Run every call of one round, at most `max_parallel_tools` at a time.
    /// Outcomes come back in request order.
    async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        sink: &Option<ProgressSink>,
    ) -> Vec<ToolOutcome> {
        for call in calls {
            emit(
                sink,
                ExecutionEvent::ToolRequested {
                    tool_call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    input: call.arguments.clone(),
                },
            )
            .await;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_parallel_tools));
        let mut join_set = JoinSet::new();
        for (index, call) in calls.iter().cloned().enumerate() {
            let registry = Arc::clone(&self.tools);
            let ctx = ctx.clone();
            let permits = Arc::clone(&permits);
            join_set.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                (index, registry.dispatch(&call, &ctx).await)
            });
        }

        let mut slots: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(task_id = %ctx.task_id, error = %e, "tool task panicked"),
            }
        }

        let outcomes: Vec<ToolOutcome> = slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| ToolOutcome {
                    tool_call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    output: format!(
                        "Error: {}",
                        LoomError::ToolExecution {
                            tool: call.tool_name.clone(),
                            reason: "tool panicked".into(),
                        }
                    ),
                    is_error: true,
                })
            })
            .collect();

        // Completion events follow request order, like the conversation.
        for outcome in &outcomes {
            emit(
                sink,
                ExecutionEvent::ToolCompleted {
                    tool_call_id: outcome.tool_call_id.clone(),
                    tool_name: outcome.tool_name.clone(),
                    is_error: outcome.is_error,
                },
            )
            .await;
        }
        outcomes
    }
}

async fn emit(sink: &Option<ProgressSink>, event: ExecutionEvent) {
    if let Some(tx) = sink {
        // A gone consumer never stops the execution.
        let _ = tx.send(event).await;
    }
}
