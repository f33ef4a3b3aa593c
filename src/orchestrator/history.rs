//! Run history persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::common::{paths, Error, Result};

use super::report::JobReport;

/// One finished job as kept on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub job: String,
    pub run_id: u64,
    pub origin: String,
    /// `plain`, `scenario`, `batch` or `failed`
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobReport> for HistoryEntry {
    fn from(report: &JobReport) -> Self {
        use super::report::JobOutcome;

        let kind = match &report.outcome {
            JobOutcome::Plain(_) => "plain",
            JobOutcome::Scenario(_) => "scenario",
            JobOutcome::Batch(_) => "batch",
            JobOutcome::Failed(_) => "failed",
        };
        Self {
            job: report.job.clone(),
            run_id: report.run_id.id(),
            origin: report.origin.to_string(),
            kind: kind.to_string(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            duration_ms: report.duration_ms,
            success: report.success,
            summary: report.summary(),
            error: report.error().map(str::to_string),
        }
    }
}

/// Where finished runs are recorded
pub trait HistoryStore: Send + Sync {
    fn record(&self, entry: HistoryEntry) -> Result<()>;

    /// Up to `limit` entries, newest last
    fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// JSON array file trimmed to the newest `keep` entries
#[derive(Debug)]
pub struct JsonHistory {
    path: PathBuf,
    keep: usize,
    lock: Mutex<()>,
}

impl JsonHistory {
    pub fn new(path: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            path: path.into(),
            keep: keep.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| Error::FileRead {
            path: self.path.display().to_string(),
            error: e.to_string(),
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl HistoryStore for JsonHistory {
    fn record(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Unreadable history, starting over");
                Vec::new()
            }
        };
        entries.push(entry);
        if entries.len() > self.keep {
            let excess = entries.len() - self.keep;
            entries.drain(..excess);
        }

        if let Some(dir) = self.path.parent() {
            paths::ensure_dir(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_all()?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(job: &str, run_id: u64) -> HistoryEntry {
        let now = Utc::now();
        HistoryEntry {
            job: job.to_string(),
            run_id,
            origin: "adhoc".to_string(),
            kind: "plain".to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 5,
            success: true,
            summary: "exit code 0".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_record_and_trim() {
        let tmp = TempDir::new().unwrap();
        let history = JsonHistory::new(tmp.path().join("nested/history.json"), 3);
        for i in 1..=5 {
            history.record(entry("nightly", i)).unwrap();
        }
        let entries = history.recent(10).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);

        let last_two = history.recent(2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].run_id, 5);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let history = JsonHistory::new(tmp.path().join("history.json"), 10);
        assert!(history.recent(5).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();
        let history = JsonHistory::new(&path, 10);
        assert!(history.recent(5).is_err());
        history.record(entry("nightly", 1)).unwrap();
        assert_eq!(history.recent(5).unwrap().len(), 1);
    }
}
