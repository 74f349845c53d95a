use loom_config::LoomConfig;
use loom_core::LoomError;
use loom_runtime::{TaskEngine, build_client, builtin_registry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub(super) async fn cmd_serve(config: LoomConfig) -> loom_core::Result<()> {
    println!("Loom v{}", env!("CARGO_PKG_VERSION"));
    println!("   Model: {}", config.agent.model);
    println!("   Listen: http://{}", config.server.listen);
    println!(
        "   Queue: {} workers, {} starts per {}ms",
        config.queue.concurrency, config.queue.rate_limit_max, config.queue.rate_limit_window_ms
    );
    println!();

    let client = build_client(&config)?;
    let engine = TaskEngine::from_config(&config, client, builtin_registry())?;

    let shutdown = CancellationToken::new();
    let workers = engine.worker_pool().spawn(shutdown.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    let served = loom_server::start_server(engine, config.server.clone(), shutdown.clone()).await;
    // A server error also stops the workers.
    shutdown.cancel();
    workers
        .await
        .map_err(|e| LoomError::Execution(format!("worker pool panicked: {}", e)))?;
    served
}
