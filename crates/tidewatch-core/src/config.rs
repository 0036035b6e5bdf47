//! Tidewatch configuration system.
//!
//! A single TOML file with three sections:
//!
//! ```toml
//! [scheduler]
//! max_workers = 4
//! poll_interval_secs = 1.0
//!
//! [logging]
//! level = "info"
//! log_dir = "~/.tidewatch/logs"
//!
//! [[tasks]]
//! id = "heartbeat"
//! command = "python3"
//! args = ["client/heart_beat.py"]
//! schedule = { type = "interval", every_secs = 30 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TidewatchError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidewatchConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl TidewatchConfig {
    /// Load config from the default path (~/.tidewatch/scheduler.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TidewatchError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TidewatchError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        tracing::debug!("📄 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TidewatchError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every section; the first problem found is returned.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.logging.validate()?;
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !seen.insert(task.id.as_str()) {
                return Err(TidewatchError::DuplicateTask(task.id.clone()));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("scheduler.toml")
    }

    /// Get the Tidewatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tidewatch")
    }
}

/// Engine settings, supplied once when the scheduler is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Timeout given to script tasks that do not set their own.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Extra attempts after a failed one, within the same dispatch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
}

fn default_max_workers() -> usize { 10 }
fn default_poll_interval() -> f64 { 1.0 }
fn default_timeout() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> f64 { 5.0 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_secs: default_poll_interval(),
            default_timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Upper bound for `scheduler.max_workers`.
pub const MAX_WORKERS: usize = 4096;

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(TidewatchError::config("max_workers must be greater than 0"));
        }
        if self.max_workers > MAX_WORKERS {
            return Err(TidewatchError::config(format!(
                "max_workers must be at most {MAX_WORKERS}, got {}",
                self.max_workers
            )));
        }
        if !is_positive_secs(self.poll_interval_secs) {
            return Err(TidewatchError::config(format!(
                "poll_interval_secs must be a positive number, got {}",
                self.poll_interval_secs
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(TidewatchError::config("default_timeout_secs must be greater than 0"));
        }
        if Duration::try_from_secs_f64(self.retry_delay_secs).is_err() {
            return Err(TidewatchError::config(format!(
                "retry_delay_secs must be >= 0, got {}",
                self.retry_delay_secs
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs).unwrap_or(Duration::from_secs(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_delay_secs).unwrap_or_default()
    }
}

fn is_positive_secs(secs: f64) -> bool {
    Duration::try_from_secs_f64(secs).is_ok_and(|d| !d.is_zero())
}

/// Log output settings for the binary. `RUST_LOG` overrides `level`.
///
/// Console output is always on. Setting `log_dir` also appends plain-text
/// lines to `log_dir/file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String { "info".into() }
fn default_log_file() -> String { "scheduler.log".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
            file: default_log_file(),
        }
    }
}

impl LoggingConfig {
    /// Log file path with `~` expanded, or `None` for console-only logging.
    pub fn file_path(&self) -> Option<PathBuf> {
        let dir = self.log_dir.as_deref()?;
        Some(PathBuf::from(shellexpand::tilde(dir).as_ref()).join(&self.file))
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_dir.is_some() && self.file.trim().is_empty() {
            return Err(TidewatchError::config("logging.file must not be empty when log_dir is set"));
        }
        Ok(())
    }
}

/// A script task declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides `scheduler.default_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub schedule: ScheduleConfig,
}

fn bool_true() -> bool { true }

impl TaskConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Working directory with `~` and `$VARS` expanded.
    pub fn expanded_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(|dir| match shellexpand::full(dir) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(dir),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TidewatchError::config("task id must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(TidewatchError::config(format!(
                "task '{}' has an empty command",
                self.id
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(TidewatchError::config(format!(
                "task '{}' has timeout_secs = 0",
                self.id
            )));
        }
        self.schedule.validate().map_err(|e| match e {
            TidewatchError::InvalidSchedule(msg) => {
                TidewatchError::InvalidSchedule(format!("task '{}': {msg}", self.id))
            }
            other => other,
        })
    }
}

/// When a configured task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Every N seconds, first run N seconds after registration.
    Interval { every_secs: f64 },
    /// Exactly once, at an absolute time.
    Once { at: DateTime<Utc> },
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleConfig::Interval { every_secs } => {
                if !is_positive_secs(*every_secs) {
                    return Err(TidewatchError::invalid_schedule(format!(
                        "interval must be greater than 0, got {every_secs}"
                    )));
                }
                Ok(())
            }
            ScheduleConfig::Once { .. } => Ok(()),
        }
    }
}
