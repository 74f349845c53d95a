use clap::{Parser, Subcommand};
use std::path::PathBuf;

use loom_config::{ConfigLoader, LoomConfig};
use loom_core::LoomError;

mod remote;
mod run;
mod serve;

/// Loom: run natural-language tasks through a tool-calling agent
#[derive(Parser)]
#[command(name = "loom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to loom.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the queue workers
    Serve,
    /// Execute one task in this process and print the result
    Run {
        /// What the agent should do
        instruction: String,
        /// Owner the task runs on behalf of
        #[arg(short, long, default_value = "local")]
        owner: String,
        /// Print progress events as they happen
        #[arg(long)]
        stream: bool,
    },
    /// Enqueue a task on a running server
    Submit {
        instruction: String,
        #[arg(short, long, default_value = "local")]
        owner: String,
        /// Idempotency key; resubmitting the same key never runs twice
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Show a task's status from a running server
    Status {
        task_id: String,
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> loom_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config, log_level);

        match self.command {
            Commands::Serve => serve::cmd_serve(config).await,
            Commands::Run {
                instruction,
                owner,
                stream,
            } => run::cmd_run(config, instruction, owner, stream).await,
            Commands::Submit {
                instruction,
                owner,
                key,
            } => remote::cmd_submit(&config, instruction, owner, key).await,
            Commands::Status { task_id, owner } => {
                remote::cmd_status(&config, &task_id, owner.as_deref()).await
            }
            Commands::Config { json } => cmd_config(&config, json),
        }
    }
}

fn init_tracing(config: &LoomConfig, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn cmd_config(config: &LoomConfig, json: bool) -> loom_core::Result<()> {
    // Never echo secrets.
    let mut shown = config.clone();
    if shown.services.anthropic_api_key.is_some() {
        shown.services.anthropic_api_key = Some("***".into());
    }
    if shown.server.api_key.is_some() {
        shown.server.api_key = Some("***".into());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        println!(
            "{}",
            toml::to_string_pretty(&shown).map_err(|e| LoomError::Config(e.to_string()))?
        );
    }
    Ok(())
}
