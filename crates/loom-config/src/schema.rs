use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, maps to `loom.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    pub tracker: TrackerConfig,
    pub streaming: StreamingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub services: ServicesConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier, e.g. "anthropic/claude-sonnet-4-20250514".
    pub model: String,
    /// System prompt sent with every model call.
    pub system_prompt: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Temperature (0.0 - 1.0).
    pub temperature: f32,
    /// Maximum tool-use rounds before the executor gives up.
    pub max_iterations: u32,
    /// Wall-clock budget for one execution, in seconds.
    pub timeout_secs: u64,
    /// Maximum tool calls run concurrently within one iteration.
    pub max_parallel_tools: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-20250514".into(),
            system_prompt: None,
            max_tokens: 4096,
            temperature: 0.2,
            max_iterations: 20,
            timeout_secs: 300,
            max_parallel_tools: 4,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

/// Where durable state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

// ── Queue ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: StoreBackend,
    /// Path to the SQLite database (sqlite backend only).
    pub db_path: PathBuf,
    /// Number of jobs processed at once.
    pub concurrency: usize,
    /// Retries after the first attempt. 3 means 4 attempts total.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff_base_ms: u64,
    /// Upper bound on any single retry delay.
    pub backoff_max_ms: u64,
    /// Maximum job starts per rolling window.
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
    /// How often idle workers look for delayed jobs that became due.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: PathBuf::from("loom.db"),
            concurrency: 5,
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            rate_limit_max: 10,
            rate_limit_window_ms: 1_000,
            poll_interval_ms: 500,
        }
    }
}

// ── Tracker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: StoreBackend,
    pub db_path: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: PathBuf::from("loom.db"),
        }
    }
}

// ── Streaming ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Seconds between heartbeat events on an open stream.
    pub heartbeat_interval_secs: u64,
    /// Events buffered per connection before sends wait.
    pub buffer: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            buffer: 128,
        }
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: String,
    /// Optional bearer token required on `/api/v1/*`.
    pub api_key: Option<String>,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3800".into(),
            api_key: None,
            cors: false,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Services ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub anthropic_api_key: Option<String>,
    /// Override for proxies and test doubles.
    pub anthropic_base_url: Option<String>,
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl LoomConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();
        let mut push = |field: &str, message: String, severity, hint: Option<&str>| {
            warnings.push(ConfigWarning {
                field: field.into(),
                message,
                severity,
                hint: hint.map(String::from),
            });
        };

        // ── Agent ───
        if self.agent.model.is_empty() {
            push(
                "agent.model",
                "model is empty".into(),
                WarningSeverity::Error,
                Some("Set to e.g. 'anthropic/claude-sonnet-4-20250514'"),
            );
        }
        if self.agent.max_iterations == 0 {
            push(
                "agent.max_iterations",
                "max_iterations is 0, no tool round could ever run".into(),
                WarningSeverity::Error,
                Some("The default is 20"),
            );
        }
        if self.agent.timeout_secs == 0 {
            push(
                "agent.timeout_secs",
                "timeout_secs is 0, every execution would time out".into(),
                WarningSeverity::Error,
                None,
            );
        }
        if self.agent.max_parallel_tools == 0 {
            push(
                "agent.max_parallel_tools",
                "max_parallel_tools is 0".into(),
                WarningSeverity::Error,
                Some("Use 1 for strictly sequential tool calls"),
            );
        }
        if !(0.0..=1.0).contains(&self.agent.temperature) {
            push(
                "agent.temperature",
                format!("temperature {} is out of range", self.agent.temperature),
                WarningSeverity::Warning,
                Some("Temperature should be between 0.0 and 1.0"),
            );
        }

        // ── Queue ───
        if self.queue.concurrency == 0 {
            push(
                "queue.concurrency",
                "concurrency is 0, no job would ever run".into(),
                WarningSeverity::Error,
                None,
            );
        }
        if self.queue.rate_limit_max == 0 || self.queue.rate_limit_window_ms == 0 {
            push(
                "queue.rate_limit_max",
                "rate limit must allow at least one start per non-empty window".into(),
                WarningSeverity::Error,
                None,
            );
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            push(
                "queue.backoff_base_ms",
                format!(
                    "base delay {}ms exceeds cap {}ms",
                    self.queue.backoff_base_ms, self.queue.backoff_max_ms
                ),
                WarningSeverity::Warning,
                Some("Every retry will wait the capped delay"),
            );
        }

        // ── Streaming ───
        if self.streaming.heartbeat_interval_secs == 0 {
            push(
                "streaming.heartbeat_interval_secs",
                "heartbeat interval is 0".into(),
                WarningSeverity::Error,
                Some("The default is 15"),
            );
        }

        // ── Server ───
        if self.server.listen.is_empty() {
            push(
                "server.listen",
                "listen address is empty".into(),
                WarningSeverity::Error,
                Some("Set to e.g. '127.0.0.1:3800'"),
            );
        } else if self.server.listen.starts_with("0.0.0.0") && self.server.api_key.is_none() {
            push(
                "server.api_key",
                "no API key set while server is network-accessible".into(),
                WarningSeverity::Warning,
                Some("Set server.api_key"),
            );
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            push(
                "logging.format",
                format!("unknown log format '{}'", self.logging.format),
                WarningSeverity::Warning,
                Some("Valid values: pretty, json, compact"),
            );
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
