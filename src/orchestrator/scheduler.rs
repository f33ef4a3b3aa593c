//! Interval triggers feeding the schedule queue

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::common::config::ScheduleEntry;

use super::Orchestrator;

/// Start one trigger task per schedule entry
///
/// Each trigger enqueues its job every `every_secs`, starting one interval
/// from now, until the orchestrator shuts down. Entries with a zero
/// interval are skipped.
pub fn spawn(orchestrator: &Orchestrator, schedules: &[ScheduleEntry]) -> Vec<JoinHandle<()>> {
    schedules
        .iter()
        .filter(|entry| {
            if entry.every_secs == 0 {
                tracing::warn!(job = %entry.job, "Ignoring schedule with zero interval");
                return false;
            }
            true
        })
        .map(|entry| {
            let period = Duration::from_secs(entry.every_secs);
            tracing::info!(job = %entry.job, every_secs = entry.every_secs, "Schedule registered");
            trigger(orchestrator.clone(), entry.job.clone(), period)
        })
        .collect()
}

/// Enqueue `job` every `period` until cancelled
pub fn trigger(orchestrator: Orchestrator, job: String, period: Duration) -> JoinHandle<()> {
    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    tracing::debug!(job = %job, "Schedule fired");
                    orchestrator.enqueue(&job);
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!(job = %job, "Schedule stopped");
    })
}
