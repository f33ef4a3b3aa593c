//! Job outcomes and orchestrator events

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::engine::{Response, ScenarioResult};

use super::gate::{Origin, RunToken};

/// What a finished job produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "lowercase")]
pub enum JobOutcome {
    Plain(Response),
    Scenario(ScenarioResult),
    Batch(BatchReport),
    /// The job could not run to a result at all
    Failed(String),
}

/// One file of a batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub file: PathBuf,
    pub success: bool,
    pub result: Option<ScenarioResult>,
    pub error: Option<String>,
}

/// Per-file results of a directory batch, in file order
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn from_entries(entries: Vec<BatchEntry>) -> Self {
        let passed = entries.iter().filter(|e| e.success).count();
        Self {
            total: entries.len(),
            failed: entries.len() - passed,
            passed,
            entries,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Terminal record of one job invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job: String,
    pub run_id: RunToken,
    pub origin: Origin,
    pub success: bool,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: JobOutcome,
}

impl JobReport {
    /// One-line human summary, used by alerts and history
    pub fn summary(&self) -> String {
        match &self.outcome {
            JobOutcome::Plain(response) => format!("exit code {}", response.exit_code),
            JobOutcome::Scenario(result) => format!(
                "{}/{} steps passed",
                result.summary.passed, result.summary.total
            ),
            JobOutcome::Batch(batch) => {
                format!("{}/{} scenarios passed", batch.passed, batch.total)
            }
            JobOutcome::Failed(error) => error.clone(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Redundant completion markers, published in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DoneSignal {
    Done,
    ExecutionComplete,
    JobFinished,
}

impl DoneSignal {
    pub const ALL: [DoneSignal; 3] = [
        DoneSignal::Done,
        DoneSignal::ExecutionComplete,
        DoneSignal::JobFinished,
    ];
}

/// Events published by the orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JobEvent {
    StateChanged {
        running: Option<String>,
        batch_mode: bool,
    },
    Started {
        job: String,
        run_id: RunToken,
        origin: Origin,
    },
    Log {
        job: String,
        message: String,
    },
    Done {
        job: String,
        run_id: RunToken,
        success: bool,
        exit_code: i32,
        signal: DoneSignal,
    },
    BatchProgress {
        job: String,
        index: usize,
        total: usize,
        file: PathBuf,
        success: bool,
    },
    QueueChanged {
        length: usize,
    },
}
