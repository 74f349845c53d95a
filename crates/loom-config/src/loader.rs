use std::path::{Path, PathBuf};
use tracing::{info, warn};

use loom_core::LoomError;

use crate::schema::LoomConfig;

/// Loads the Loom configuration once at startup.
pub struct ConfigLoader {
    config: LoomConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > LOOM_CONFIG env > ~/.loom/loom.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LOOM_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loom")
            .join("loom.toml")
    }

    /// Load the config from disk, falling back to defaults when the file is absent.
    pub fn load(path: Option<&Path>) -> loom_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            LoomConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get(&self) -> LoomConfig {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse_file(path: &Path) -> loom_core::Result<LoomConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<LoomConfig>(&raw)
            .map_err(|e| LoomError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Log warnings, fail on errors.
    fn check(config: &LoomConfig) -> loom_core::Result<()> {
        let warnings = config.validate().map_err(LoomError::Config)?;
        for w in &warnings {
            warn!("{}", w);
        }
        Ok(())
    }

    /// Apply env var overrides (LOOM_AGENT_MODEL, LOOM_MAX_ITERATIONS, etc.)
    fn apply_env_overrides(mut config: LoomConfig) -> LoomConfig {
        if let Ok(v) = std::env::var("LOOM_AGENT_MODEL") {
            config.agent.model = v;
        }
        if let Some(v) = env_parse::<u32>("LOOM_MAX_ITERATIONS") {
            config.agent.max_iterations = v;
        }
        if let Some(v) = env_parse::<u64>("LOOM_TIMEOUT_SECS") {
            config.agent.timeout_secs = v;
        }
        if let Some(v) = env_parse::<usize>("LOOM_QUEUE_CONCURRENCY") {
            config.queue.concurrency = v;
        }
        if let Ok(v) = std::env::var("LOOM_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("LOOM_LOG_LEVEL") {
            config.logging.level = v;
        }
        // Config file takes priority; env is the fallback for the key.
        if config.services.anthropic_api_key.is_none() {
            if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
                config.services.anthropic_api_key = Some(v);
            }
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}
