//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Process and scenario engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Job gate and schedule queue settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Run history settings
    #[serde(default)]
    pub history: HistoryConfig,

    /// Alert delivery settings
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Interval schedules feeding the schedule queue
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

/// Engine settings
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Default target executable when a job or command does not name one
    pub binary_path: Option<PathBuf>,

    /// Per-step process timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Output decoding label (encoding_rs / WHATWG label)
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Decoding label used instead of `encoding` on Windows targets
    #[serde(default = "default_legacy_encoding")]
    pub legacy_encoding: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            timeout_ms: default_timeout_ms(),
            encoding: default_encoding(),
            legacy_encoding: default_legacy_encoding(),
        }
    }
}

impl EngineConfig {
    /// Step timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Encoding label effective on the current platform
    pub fn effective_encoding(&self) -> &str {
        if cfg!(windows) {
            &self.legacy_encoding
        } else {
            &self.encoding
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_legacy_encoding() -> String {
    "windows-949".to_string()
}
fn default_true() -> bool {
    true
}

/// Orchestrator settings
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding `<job>.json` descriptors
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Delay before retrying a queue head whose job is still running
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Retries before a queue item is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between a job finishing and the next queue drain
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Pause between two queue dispatches
    #[serde(default = "default_dispatch_gap_ms")]
    pub dispatch_gap_ms: u64,

    /// Default fan-out for directory batches
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            backoff_ms: default_backoff_ms(),
            max_retries: default_max_retries(),
            cooldown_ms: default_cooldown_ms(),
            dispatch_gap_ms: default_dispatch_gap_ms(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl OrchestratorConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn dispatch_gap(&self) -> Duration {
        Duration::from_millis(self.dispatch_gap_ms)
    }
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}
fn default_backoff_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    2_000
}
fn default_dispatch_gap_ms() -> u64 {
    1_000
}
fn default_batch_concurrency() -> usize {
    1
}

/// Run history settings
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// History file; defaults to the platform data dir
    pub path: Option<PathBuf>,

    /// Number of entries kept
    #[serde(default = "default_history_keep")]
    pub keep: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            keep: default_history_keep(),
        }
    }
}

impl HistoryConfig {
    /// Resolved history file path
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(paths::history_path)
    }
}

fn default_history_keep() -> usize {
    500
}

/// Alert settings
#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    /// Webhook receiving JSON alerts; alerts only go to the log when unset
    pub webhook_url: Option<String>,

    #[serde(default = "default_true")]
    pub on_start: bool,

    #[serde(default = "default_true")]
    pub on_success: bool,

    #[serde(default = "default_true")]
    pub on_error: bool,

    /// Upper bound on one alert delivery
    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            on_start: true,
            on_success: true,
            on_error: true,
            timeout_ms: default_alert_timeout_ms(),
        }
    }
}

impl AlertConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_alert_timeout_ms() -> u64 {
    5_000
}

/// An interval schedule
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleEntry {
    /// Job name to enqueue
    pub job: String,
    /// Trigger interval in seconds
    pub every_secs: u64,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = paths::config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}
