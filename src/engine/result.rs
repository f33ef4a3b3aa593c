//! Execution results
//!
//! A [`Response`] is created once per step execution and never changes.
//! [`StepResult`]s are appended to a [`ScenarioResult`]; only the
//! re-validation pass in [`super::assert::revalidate`] may replace a step's
//! assertions afterwards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::scenario::ScenarioInfo;

use super::assert::AssertionResult;
use super::variables::Vars;

/// Structured output of one target invocation
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Exit code; `-1` when the process was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// `key=value` stdout lines, keys lowercased
    pub parsed_fields: BTreeMap<String, String>,
    /// The single positional argument passed to the executable
    pub command_line: String,
    pub started_at: DateTime<Utc>,
}

impl Response {
    /// Parse `key=value` lines into a lowercase-keyed map
    ///
    /// Keys are ASCII word characters; the value is the rest of the line.
    /// Later duplicates overwrite earlier ones.
    pub fn parse_fields(stdout: &str) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        for line in stdout.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let is_word =
                    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if is_word {
                    fields.insert(key.to_ascii_lowercase(), value.to_string());
                }
            }
        }
        fields
    }

    /// Case-insensitive parsed field lookup
    pub fn field(&self, key: &str) -> Option<&str> {
        self.parsed_fields
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Zero-based position in the scenario
    pub index: usize,
    /// Step name after substitution
    pub name: String,
    pub command: String,
    pub command_line: String,
    pub response: Option<Response>,
    /// Values extracted by this step only
    pub extracted: Vars,
    pub assertions: Vec<AssertionResult>,
    pub passed: bool,
    /// Process-level failure (spawn, timeout, cancellation)
    pub error: Option<String>,
}

impl StepResult {
    pub fn duration_ms(&self) -> u64 {
        self.response.as_ref().map(|r| r.duration_ms).unwrap_or(0)
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &AssertionResult> {
        self.assertions.iter().filter(|a| !a.passed)
    }
}

/// Totals over executed steps
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Terminal result of a scenario run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub info: ScenarioInfo,
    pub steps: Vec<StepResult>,
    pub summary: ScenarioSummary,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioResult {
    /// Recompute pass/fail counters and overall success from the steps
    pub fn recompute(&mut self) {
        let passed = self.steps.iter().filter(|s| s.passed).count();
        self.summary.total = self.steps.len();
        self.summary.passed = passed;
        self.summary.failed = self.steps.len() - passed;
        self.success = self.summary.failed == 0;
    }

    /// Percentage of passed steps, 0 when nothing ran
    pub fn success_rate(&self) -> f64 {
        if self.summary.total == 0 {
            return 0.0;
        }
        self.summary.passed as f64 * 100.0 / self.summary.total as f64
    }
}
