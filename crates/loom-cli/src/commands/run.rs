use loom_config::LoomConfig;
use loom_core::{StreamEvent, StreamPayload, ToolUsePhase};
use loom_runtime::{TaskEngine, TaskSubmission, build_client, builtin_registry};
use tokio::sync::mpsc;

/// Run one task in-process. Task records stay in memory.
pub(super) async fn cmd_run(
    config: LoomConfig,
    instruction: String,
    owner: String,
    stream: bool,
) -> loom_core::Result<()> {
    let client = build_client(&config)?;
    let engine = TaskEngine::in_memory(&config, client, builtin_registry());
    let submission = TaskSubmission::new(owner, instruction);

    if !stream {
        let resp = engine.run(submission).await?;
        println!("{}", resp.result);
        eprintln!(
            "\n[{}] {} iteration(s), {} tool call(s), {}ms",
            resp.task_id, resp.metadata.iterations, resp.metadata.tools_used, resp.metadata.duration_ms
        );
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel(engine.options().stream_buffer);
    let (task_id, join) = engine.spawn_streamed(submission, tx).await?;
    eprintln!("[{}] started", task_id);
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }
    let _ = join.await;

    let task = engine.status(&task_id, None).await?;
    match task.error {
        Some(err) => Err(loom_core::LoomError::Execution(err.to_string())),
        None => Ok(()),
    }
}

fn print_event(event: &StreamEvent) {
    match &event.payload {
        StreamPayload::Progress { message, .. } => eprintln!("  … {}", message),
        StreamPayload::Thinking { content } => eprintln!("  ~ {}", content),
        StreamPayload::ToolUse {
            tool_name, phase, ..
        } => {
            let mark = match phase {
                ToolUsePhase::Started => "→",
                ToolUsePhase::Completed => "✓",
                ToolUsePhase::Failed => "✗",
            };
            eprintln!("  {} {}", mark, tool_name);
        }
        StreamPayload::Complete { result, .. } => println!("{}", result),
        StreamPayload::Error { code, message, .. } => eprintln!("  ✗ {}: {}", code, message),
        StreamPayload::Heartbeat => {}
    }
}
