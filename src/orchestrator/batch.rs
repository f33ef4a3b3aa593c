//! Directory batches
//!
//! Runs every file of a batch plan while batch mode is on. A failing file
//! never stops the rest. Fan-out is bounded and results keep file order.

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::common::Error;
use crate::engine::EventBus;

use super::executor::JobExecutor;
use super::gate::{Gate, Origin};
use super::job::ResolvedJob;
use super::report::{BatchEntry, BatchReport, JobEvent};

/// Everything a batch borrows from the orchestrator
pub struct BatchContext<'a> {
    pub executor: &'a dyn JobExecutor,
    pub gate: &'a Gate,
    pub events: &'a EventBus<JobEvent>,
}

impl BatchContext<'_> {
    /// Run `files` with at most `concurrency` in flight
    pub async fn run(
        &self,
        job: &ResolvedJob,
        files: &[PathBuf],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let total = files.len();
        tracing::info!(job = %job.name(), files = total, concurrency, "Batch started");

        let runs: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(index, file)| self.run_file(job, index, total, file, cancel).boxed())
            .collect();
        let entries: Vec<BatchEntry> = stream::iter(runs)
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let report = BatchReport::from_entries(entries);
        tracing::info!(
            job = %job.name(),
            passed = report.passed,
            failed = report.failed,
            "Batch finished"
        );
        report
    }

    async fn run_file(
        &self,
        job: &ResolvedJob,
        index: usize,
        total: usize,
        file: &Path,
        cancel: &CancellationToken,
    ) -> BatchEntry {
        let label = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());

        let entry = if cancel.is_cancelled() {
            failed_entry(file, Error::Cancelled.to_string())
        } else {
            match self
                .gate
                .admit_guarded(&format!("{}/{}", job.name(), label), Origin::Batch)
            {
                Err(e) => failed_entry(file, e.to_string()),
                Ok(run) => {
                    self.events.publish(JobEvent::Log {
                        job: job.name().to_string(),
                        message: format!("[{}/{}] {}", index + 1, total, label),
                    });
                    let outcome = self.executor.run_scenario(job, file, cancel).await;
                    drop(run);
                    match outcome {
                        Ok(result) => BatchEntry {
                            file: file.to_path_buf(),
                            success: result.success,
                            result: Some(result),
                            error: None,
                        },
                        Err(e) => failed_entry(file, e.to_string()),
                    }
                }
            }
        };

        if let Some(error) = &entry.error {
            tracing::warn!(job = %job.name(), file = %label, error = %error, "Batch file failed");
        }
        self.events.publish(JobEvent::BatchProgress {
            job: job.name().to_string(),
            index,
            total,
            file: file.to_path_buf(),
            success: entry.success,
        });
        entry
    }
}

fn failed_entry(file: &Path, error: String) -> BatchEntry {
    BatchEntry {
        file: file.to_path_buf(),
        success: false,
        result: None,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::EngineConfig;
    use crate::common::Result;
    use crate::engine::{Response, ScenarioResult, ScenarioSummary};
    use crate::orchestrator::job::{resolve, JobDescriptor};
    use crate::scenario::ScenarioInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Fails files whose name contains "bad", errors on "broken", panics
    /// on "panic"
    #[derive(Default)]
    struct FakeExecutor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for FakeExecutor {
        async fn run_plain(&self, _job: &ResolvedJob, _cancel: &CancellationToken) -> Result<Response> {
            Err(Error::Internal("not used".to_string()))
        }

        async fn run_scenario(
            &self,
            _job: &ResolvedJob,
            path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<ScenarioResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name.contains("panic") {
                panic!("scenario exploded");
            }
            if name.contains("broken") {
                return Err(Error::scenario_load(path, "bad yaml"));
            }
            let success = !name.contains("bad");
            Ok(ScenarioResult {
                info: ScenarioInfo {
                    name,
                    ..Default::default()
                },
                steps: Vec::new(),
                summary: ScenarioSummary::default(),
                success,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
        }
    }

    fn job(root: &Path) -> ResolvedJob {
        std::fs::write(root.join("target"), "").unwrap();
        let descriptor = JobDescriptor {
            name: "suite".to_string(),
            binary_path: Some(PathBuf::from("target")),
            ..Default::default()
        };
        resolve(descriptor, root, &EngineConfig::default()).unwrap()
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_batch() {
        let tmp = TempDir::new().unwrap();
        let executor = FakeExecutor::default();
        let gate = Arc::new(Gate::new());
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let guard = gate.enter_batch("suite", Origin::Adhoc).unwrap();
        let ctx = BatchContext {
            executor: &executor,
            gate: &gate,
            events: &events,
        };
        let report = ctx
            .run(
                &job(tmp.path()),
                &files(&["1.yaml", "2.yaml", "3_bad.yaml", "4.yaml", "5_broken.yaml"]),
                1,
                &CancellationToken::new(),
            )
            .await;
        drop(guard);

        assert_eq!((report.total, report.passed, report.failed), (5, 3, 2));
        assert!(report.entries[3].success);
        assert_eq!(report.entries[2].error, None);
        assert!(report.entries[4].error.as_deref().unwrap().contains("bad yaml"));
        assert!(gate.running().is_none());
        assert!(gate.active_jobs().is_empty());

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::BatchProgress { index, .. } = event {
                progress.push(index);
            }
        }
        assert_eq!(progress, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_bounded_fan_out_keeps_order() {
        let tmp = TempDir::new().unwrap();
        let executor = FakeExecutor::default();
        let gate = Arc::new(Gate::new());
        let events = EventBus::default();
        let _guard = gate.enter_batch("suite", Origin::Adhoc).unwrap();

        let names = ["a.yaml", "b.yaml", "c.yaml", "d.yaml", "e.yaml", "f.yaml"];
        let report = BatchContext {
            executor: &executor,
            gate: &gate,
            events: &events,
        }
        .run(&job(tmp.path()), &files(&names), 3, &CancellationToken::new())
        .await;

        let order: Vec<_> = report
            .entries
            .iter()
            .map(|e| e.file.to_string_lossy().into_owned())
            .collect();
        assert_eq!(order, names);
        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
        assert!(executor.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_remaining() {
        let tmp = TempDir::new().unwrap();
        let executor = FakeExecutor::default();
        let gate = Arc::new(Gate::new());
        let events = EventBus::default();
        let _guard = gate.enter_batch("suite", Origin::Adhoc).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = BatchContext {
            executor: &executor,
            gate: &gate,
            events: &events,
        }
        .run(&job(tmp.path()), &files(&["a.yaml", "b.yaml"]), 1, &cancel)
        .await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.entries[0].error.as_deref(), Some("Execution cancelled"));
    }

    #[tokio::test]
    async fn test_panicking_file_releases_its_run() {
        let tmp = TempDir::new().unwrap();
        let executor = FakeExecutor::default();
        let gate = Arc::new(Gate::new());
        let events = EventBus::default();
        let _guard = gate.enter_batch("suite", Origin::Adhoc).unwrap();

        let ctx = BatchContext {
            executor: &executor,
            gate: &gate,
            events: &events,
        };
        let outcome = std::panic::AssertUnwindSafe(ctx.run(
            &job(tmp.path()),
            &files(&["a_panic.yaml"]),
            1,
            &CancellationToken::new(),
        ))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(gate.active_jobs(), vec!["suite".to_string()]);
    }
}
