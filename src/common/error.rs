//! Error types for the scenario harness
//!
//! Errors fall into a few families: configuration problems that reject a
//! job before it is admitted, process failures that abort a single step,
//! gate rejections, and schedule queue exhaustion. Extraction misses and
//! assertion failures are not errors; they are reported as data.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("Failed to load scenario '{path}': {reason}")]
    ScenarioLoad { path: String, reason: String },

    #[error("Target executable not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === Process Errors ===
    #[error("Failed to start '{path}': {reason}")]
    ProcessSpawn { path: String, reason: String },

    #[error("Command timeout after {0}ms")]
    ProcessTimeout(u64),

    #[error("Process exited with code {0}")]
    ProcessExit(i32),

    #[error("Execution cancelled")]
    Cancelled,

    // === Orchestration Errors ===
    #[error("Job '{running}' is already running")]
    AlreadyRunning { running: String },

    #[error("Scheduled job '{job}' dropped after {retries} retries")]
    QueueRetriesExhausted { job: String, retries: u32 },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Alert delivery ===
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a scenario load error
    pub fn scenario_load(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::ScenarioLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid job error
    pub fn invalid_job(job: &str, reason: &str) -> Self {
        Self::InvalidJob {
            job: job.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a spawn failure error
    pub fn spawn_failed(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::ProcessSpawn {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable code for front-door collaborators
    pub fn code(&self) -> &'static str {
        match self {
            Error::JobNotFound(_) => "job_not_found",
            Error::InvalidJob { .. } => "invalid_job",
            Error::ScenarioLoad { .. } => "scenario_not_loaded",
            Error::BinaryNotFound(_) => "binary_not_found",
            Error::Config(_) | Error::ConfigParse(_) => "config_error",
            Error::ProcessSpawn { .. } => "spawn_failed",
            Error::ProcessTimeout(_) => "timeout",
            Error::ProcessExit(_) => "non_zero_exit",
            Error::Cancelled => "cancelled",
            Error::AlreadyRunning { .. } => "already_running",
            Error::QueueRetriesExhausted { .. } => "queue_retries_exhausted",
            _ => "internal_error",
        }
    }

    /// Whether this error rejects a job before it is admitted
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::JobNotFound(_)
                | Error::InvalidJob { .. }
                | Error::ScenarioLoad { .. }
                | Error::BinaryNotFound(_)
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }

    /// Whether this error came from running the target executable
    pub fn is_process_error(&self) -> bool {
        matches!(
            self,
            Error::ProcessSpawn { .. }
                | Error::ProcessTimeout(_)
                | Error::ProcessExit(_)
                | Error::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_code() {
        let err = Error::AlreadyRunning {
            running: "nightly".to_string(),
        };
        assert_eq!(err.code(), "already_running");
        assert_eq!(err.to_string(), "Job 'nightly' is already running");
    }

    #[test]
    fn test_error_families() {
        assert!(Error::JobNotFound("x".into()).is_config_error());
        assert!(Error::BinaryNotFound(PathBuf::from("/nope")).is_config_error());
        assert!(Error::ProcessTimeout(100).is_process_error());
        assert!(!Error::ProcessTimeout(100).is_config_error());
        assert_eq!(Error::ProcessTimeout(250).to_string(), "Command timeout after 250ms");
    }
}
