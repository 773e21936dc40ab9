//! Layered configuration for Cadence.
//!
//! Settings are read from `.cadence/cadence.toml` and merged in order
//! file → environment → CLI. A missing file means defaults.
//!
//! ```toml
//! [engine]
//! max_workers = 8
//! max_conflict_retries = 1
//! requeue_delay_ms = 50
//! max_requeues = 5
//! event_buffer = 1024
//!
//! [timeouts]
//! default = "10m"
//!
//! [logging]
//! level = "info"
//! json = false
//! log_dir = ".cadence/logs"
//! ```

use crate::engine::EngineConfig;
use anyhow::{Context, Result};
use cadence_common::parse_timeout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CADENCE_DIR: &str = ".cadence";
pub const CONFIG_FILE: &str = "cadence.toml";

pub const ENV_MAX_WORKERS: &str = "CADENCE_MAX_WORKERS";
pub const ENV_LOG_LEVEL: &str = "CADENCE_LOG_LEVEL";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize {
    8
}

fn default_max_conflict_retries() -> u32 {
    1
}

fn default_requeue_delay_ms() -> u64 {
    50
}

fn default_max_requeues() -> u32 {
    5
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_conflict_retries: default_max_conflict_retries(),
            requeue_delay_ms: default_requeue_delay_ms(),
            max_requeues: default_max_requeues(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Applied when a plan node declares no timeout. Empty disables it.
    #[serde(default = "default_timeout")]
    pub default: String,
}

fn default_timeout() -> String {
    "10m".to_string()
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            default: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

/// The complete cadence.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CadenceToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cadence.toml")
    }

    /// Load `cadence.toml` from `cadence_dir`, or defaults if it does not exist.
    pub fn load_or_default(cadence_dir: &Path) -> Result<Self> {
        let config_path = cadence_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cadence.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup(ENV_MAX_WORKERS).and_then(|v| v.trim().parse().ok()) {
            self.engine.max_workers = workers;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
    }

    /// Default node timeout, `None` when disabled.
    pub fn default_timeout(&self) -> Result<Option<Duration>> {
        if self.timeouts.default.trim().is_empty() {
            return Ok(None);
        }
        let duration = parse_timeout(&self.timeouts.default)
            .with_context(|| format!("Invalid default timeout '{}'", self.timeouts.default))?;
        Ok(Some(duration))
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_workers == 0 {
            warnings.push("engine.max_workers must be at least 1".to_string());
        }
        if self.engine.event_buffer == 0 {
            warnings.push("engine.event_buffer must be at least 1".to_string());
        }
        if !self.timeouts.default.trim().is_empty()
            && let Err(e) = parse_timeout(&self.timeouts.default)
        {
            warnings.push(format!("Invalid timeouts.default: {}", e));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            warnings.push(format!(
                "Unknown logging.level '{}': expected one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    pub project_dir: PathBuf,
    pub cadence_dir: PathBuf,
    /// File values with environment overrides applied
    pub toml: CadenceToml,
    pub verbose: bool,
    pub cli_max_workers: Option<usize>,
}

impl CadenceConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let cadence_dir = project_dir.join(CADENCE_DIR);
        let mut toml = CadenceToml::load_or_default(&cadence_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            cadence_dir,
            toml,
            verbose: false,
            cli_max_workers: None,
        })
    }

    /// Create with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_workers: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_max_workers = max_workers;
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.cadence_dir.join(CONFIG_FILE)
    }

    /// Worker pool size (CLI → env → file).
    pub fn max_workers(&self) -> usize {
        self.cli_max_workers.unwrap_or(self.toml.engine.max_workers)
    }

    /// Logging settings with `--verbose` applied.
    pub fn logging(&self) -> LoggingSection {
        let mut logging = self.toml.logging.clone();
        if self.verbose {
            logging.level = "debug".to_string();
        }
        if let Some(dir) = logging.log_dir.take() {
            logging.log_dir = Some(if dir.is_absolute() {
                dir
            } else {
                self.project_dir.join(dir)
            });
        }
        logging
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let engine = &self.toml.engine;
        Ok(EngineConfig {
            max_workers: self.max_workers().max(1),
            max_conflict_retries: engine.max_conflict_retries,
            requeue_delay: Duration::from_millis(engine.requeue_delay_ms),
            max_requeues: engine.max_requeues,
            event_buffer: engine.event_buffer.max(1),
            default_timeout: self.toml.default_timeout()?,
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
