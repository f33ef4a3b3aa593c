//! Job orchestrator
//!
//! Serializes ad-hoc job submissions through the running-state [`Gate`],
//! feeds scheduled runs through the [`ScheduleQueue`], and finalizes every
//! admitted run exactly once: done signals, token-guarded slot release,
//! history, one alert, then a queue drain after the cooldown.

pub mod batch;
pub mod executor;
pub mod gate;
pub mod history;
pub mod job;
pub mod notify;
pub mod queue;
pub mod report;
pub mod scheduler;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::engine::EventBus;

pub use executor::{EngineExecutor, JobExecutor};
pub use gate::{BatchModeGuard, Gate, Origin, RunToken, RunningState};
pub use history::{HistoryEntry, HistoryStore, JsonHistory};
pub use job::{DirJobSource, JobDescriptor, JobPlan, JobSource, ResolvedJob, StaticJobs};
pub use notify::{Alert, LogNotifier, Notifier, WebhookNotifier};
pub use queue::{QueueStatus, ScheduleQueue};
pub use report::{BatchEntry, BatchReport, DoneSignal, JobEvent, JobOutcome, JobReport};

use batch::BatchContext;

/// Snapshot returned by [`Orchestrator::get_status`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub running: Option<RunningState>,
    pub batch_mode: bool,
    /// Every run in flight, including overlapping scheduled ones
    pub active: Vec<String>,
    pub queue: QueueStatus,
}

/// A submitted job
#[derive(Debug)]
pub struct JobHandle {
    job: String,
    run_id: RunToken,
    origin: Origin,
    report: oneshot::Receiver<JobReport>,
}

impl JobHandle {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn run_id(&self) -> RunToken {
        self.run_id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Wait for the terminal report
    pub async fn wait(self) -> Result<JobReport> {
        self.report
            .await
            .map_err(|_| Error::Internal(format!("job '{}' ended without a report", self.job)))
    }
}

pub(crate) struct Inner {
    config: Config,
    jobs: Box<dyn JobSource>,
    executor: Box<dyn JobExecutor>,
    notifier: Box<dyn Notifier>,
    history: Option<Box<dyn HistoryStore>>,
    gate: Arc<Gate>,
    queue: ScheduleQueue,
    events: EventBus<JobEvent>,
    cancel: CancellationToken,
}

/// Cheap-to-clone handle over the shared orchestrator state
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Builds an [`Orchestrator`]; unset parts come from the configuration
pub struct OrchestratorBuilder {
    config: Config,
    jobs: Option<Box<dyn JobSource>>,
    executor: Option<Box<dyn JobExecutor>>,
    notifier: Option<Box<dyn Notifier>>,
    history: Option<Box<dyn HistoryStore>>,
}

impl OrchestratorBuilder {
    pub fn jobs(mut self, jobs: impl JobSource + 'static) -> Self {
        self.jobs = Some(Box::new(jobs));
        self
    }

    pub fn executor(mut self, executor: impl JobExecutor + 'static) -> Self {
        self.executor = Some(Box::new(executor));
        self
    }

    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Some(Box::new(notifier));
        self
    }

    pub fn history(mut self, history: impl HistoryStore + 'static) -> Self {
        self.history = Some(Box::new(history));
        self
    }

    /// Build and start the queue worker; must run inside a tokio runtime
    pub fn build(self) -> Orchestrator {
        let (queue, kicks) = ScheduleQueue::new();
        let jobs = self
            .jobs
            .unwrap_or_else(|| Box::new(DirJobSource::new(&self.config.orchestrator.jobs_dir)));
        let notifier = self
            .notifier
            .unwrap_or_else(|| notify::from_config(&self.config.alerts));
        let executor = self
            .executor
            .unwrap_or_else(|| Box::new(EngineExecutor::new()));

        let inner = Arc::new(Inner {
            config: self.config,
            jobs,
            executor,
            notifier,
            history: self.history,
            gate: Arc::new(Gate::new()),
            queue,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(queue::worker(Arc::downgrade(&inner), kicks));
        Orchestrator { inner }
    }
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            jobs: None,
            executor: None,
            notifier: None,
            history: None,
        }
    }

    /// Resolve, admit and start a job
    ///
    /// Configuration problems and gate rejections are returned before
    /// anything runs. The job itself runs on its own task.
    pub fn submit(&self, job: &str, origin: Origin) -> Result<JobHandle> {
        self.inner.submit(job, origin)
    }

    /// Queue a scheduled run; false when the job is already queued
    pub fn enqueue(&self, job: &str) -> bool {
        let added = self.inner.queue.push(job);
        if added {
            tracing::info!(job, length = self.inner.queue.len(), "Job queued");
            self.inner.events.publish(JobEvent::QueueChanged {
                length: self.inner.queue.len(),
            });
            self.inner.queue.kick();
        } else {
            tracing::debug!(job, "Job already queued");
        }
        added
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.inner.gate.running(),
            batch_mode: self.inner.gate.batch_mode(),
            active: self.inner.gate.active_jobs(),
            queue: self.inner.queue.status(),
        }
    }

    /// Clear the running slot and batch mode, returning what was there
    pub async fn force_reset(&self) -> Option<RunningState> {
        let previous = self.inner.gate.force_reset();
        tracing::warn!(
            previous = ?previous.as_ref().map(|p| p.job_name.as_str()),
            "Running state forcibly reset"
        );
        self.inner.publish_state();
        self.inner.alert(
            Alert::ForcedReset {
                previous: previous.clone(),
            },
        )
        .await;
        self.inner.queue.kick();
        previous
    }

    /// Stop the queue worker, schedules and in-flight jobs
    pub fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.inner.cancel.cancel();
    }

    pub fn events(&self) -> &EventBus<JobEvent> {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Token cancelled by [`Orchestrator::shutdown`]
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Recent history, newest last; empty without a history store
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        match &self.inner.history {
            Some(store) => store.recent(limit),
            None => Ok(Vec::new()),
        }
    }
}

impl Inner {
    async fn alert(&self, alert: Alert) {
        notify::deliver(self.notifier.as_ref(), alert, self.config.alerts.timeout()).await;
    }

    fn publish_state(&self) {
        self.events.publish(JobEvent::StateChanged {
            running: self.gate.running().map(|r| r.job_name),
            batch_mode: self.gate.batch_mode(),
        });
    }

    fn submit(self: &Arc<Self>, name: &str, origin: Origin) -> Result<JobHandle> {
        let job = self.jobs.resolve(name, &self.config.engine)?;

        let (token, guard) = match &job.plan {
            JobPlan::Batch { .. } => {
                let guard = self.gate.enter_batch(name, origin)?;
                (guard.token(), Some(guard))
            }
            _ => (self.gate.admit(name, origin)?, None),
        };

        tracing::info!(job = name, run = %token, %origin, plan = job.plan.kind(), "Job admitted");
        self.publish_state();
        self.events.publish(JobEvent::Started {
            job: name.to_string(),
            run_id: token,
            origin,
        });

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let report = inner.execute(job, token, origin, guard).await;
            let _ = tx.send(report);
        });

        Ok(JobHandle {
            job: name.to_string(),
            run_id: token,
            origin,
            report: rx,
        })
    }

    async fn execute(
        self: Arc<Self>,
        job: ResolvedJob,
        token: RunToken,
        origin: Origin,
        guard: Option<BatchModeGuard>,
    ) -> JobReport {
        let started_at = Utc::now();
        let start = Instant::now();

        self.alert(
            Alert::Started {
                job: job.name().to_string(),
                run_id: token,
                origin,
                collection: job.collection_label(),
            },
        )
        .await;

        let cancel = self.cancel.child_token();
        let outcome = AssertUnwindSafe(self.run_plan(&job, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                tracing::error!(job = %job.name(), panic = %message, "Job panicked");
                JobOutcome::Failed(format!("panic: {}", message))
            });

        let (success, exit_code) = match &outcome {
            JobOutcome::Plain(response) => (response.success(), response.exit_code),
            JobOutcome::Scenario(result) => (result.success, i32::from(!result.success)),
            JobOutcome::Batch(batch) => (batch.success(), i32::from(!batch.success())),
            JobOutcome::Failed(_) => (false, 1),
        };

        let report = JobReport {
            job: job.name().to_string(),
            run_id: token,
            origin,
            success,
            exit_code,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            outcome,
        };

        self.finalize(&report, guard).await;
        report
    }

    async fn run_plan(&self, job: &ResolvedJob, cancel: &CancellationToken) -> JobOutcome {
        match &job.plan {
            JobPlan::Plain => match self.executor.run_plain(job, cancel).await {
                Ok(response) => {
                    if let Some(e) = executor::plain_error(&response) {
                        self.events.publish(JobEvent::Log {
                            job: job.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                    JobOutcome::Plain(response)
                }
                Err(e) => JobOutcome::Failed(e.to_string()),
            },
            JobPlan::Scenario(path) => match self.executor.run_scenario(job, path, cancel).await {
                Ok(result) => JobOutcome::Scenario(result),
                Err(e) => JobOutcome::Failed(e.to_string()),
            },
            JobPlan::Batch { files, .. } => {
                let ctx = BatchContext {
                    executor: self.executor.as_ref(),
                    gate: &self.gate,
                    events: &self.events,
                };
                let concurrency = job.concurrency(self.config.orchestrator.batch_concurrency);
                JobOutcome::Batch(ctx.run(job, files, concurrency, cancel).await)
            }
        }
    }

    /// Terminal handling, once per admitted run
    async fn finalize(&self, report: &JobReport, guard: Option<BatchModeGuard>) {
        for signal in DoneSignal::ALL {
            self.events.publish(JobEvent::Done {
                job: report.job.clone(),
                run_id: report.run_id,
                success: report.success,
                exit_code: report.exit_code,
                signal,
            });
        }

        drop(guard);
        let released = self.gate.complete(report.run_id);
        self.publish_state();

        tracing::info!(
            job = %report.job,
            run = %report.run_id,
            success = report.success,
            duration_ms = report.duration_ms,
            released,
            summary = %report.summary(),
            "Job finished"
        );

        if let Some(history) = &self.history {
            if let Err(e) = history.record(HistoryEntry::from(report)) {
                tracing::warn!(job = %report.job, error = %e, "Failed to record history");
            }
        }

        self.alert(
            Alert::Finished {
                job: report.job.clone(),
                run_id: report.run_id,
                success: report.success,
                exit_code: report.exit_code,
                duration_ms: report.duration_ms,
                summary: report.summary(),
            },
        )
        .await;

        let kick = self.queue.kicker();
        let cooldown = self.config.orchestrator.cooldown();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {
                    let _ = kick.send(());
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}
