//! Running-state gate
//!
//! The single-flight slot for ad-hoc submissions. Check-and-set happens
//! under one lock so two concurrent submissions can never both see an
//! empty slot. Every admitted run gets a [`RunToken`]; completion clears
//! the slot only when it still holds that token.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::{Error, Result};

/// Where a submission came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Operator or API request; single-flight
    Adhoc,
    /// Dispatched from the schedule queue; may overlap
    Scheduled,
    /// One file of a directory batch
    Batch,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Adhoc => write!(f, "adhoc"),
            Origin::Scheduled => write!(f, "scheduled"),
            Origin::Batch => write!(f, "batch"),
        }
    }
}

/// Identity of one admitted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RunToken(u64);

impl RunToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RunToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Contents of the running slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningState {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub token: RunToken,
    pub origin: Origin,
}

#[derive(Debug, Default)]
struct GateInner {
    running: Option<RunningState>,
    batch_mode: bool,
    active: BTreeMap<RunToken, String>,
    next_token: u64,
}

impl GateInner {
    fn issue(&mut self, job: &str) -> RunToken {
        self.next_token += 1;
        let token = RunToken(self.next_token);
        self.active.insert(token, job.to_string());
        token
    }
}

/// Admission control shared by the orchestrator, its queue and batches
#[derive(Debug, Default)]
pub struct Gate {
    inner: Mutex<GateInner>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a run
    ///
    /// Ad-hoc and batch submissions are rejected while the slot is taken,
    /// unless batch mode is on. Scheduled runs are always admitted. A run
    /// only takes the slot when it is free; an overlapping run is tracked
    /// as active without owning the slot.
    pub fn admit(&self, job: &str, origin: Origin) -> Result<RunToken> {
        let mut inner = self.lock();

        if let Some(running) = &inner.running {
            if origin != Origin::Scheduled && !inner.batch_mode {
                return Err(Error::AlreadyRunning {
                    running: running.job_name.clone(),
                });
            }
        }

        let token = inner.issue(job);
        if inner.running.is_none() {
            inner.running = Some(RunningState {
                job_name: job.to_string(),
                started_at: Utc::now(),
                token,
                origin,
            });
        } else {
            tracing::debug!(job, %origin, %token, "Admitted alongside running job");
        }
        Ok(token)
    }

    /// Mark a run complete
    ///
    /// Returns true when the slot was held by `token` and is now free.
    /// Completing a token twice is a no-op.
    pub fn complete(&self, token: RunToken) -> bool {
        let mut inner = self.lock();
        inner.active.remove(&token);
        match &inner.running {
            Some(running) if running.token == token => {
                inner.running = None;
                true
            }
            _ => false,
        }
    }

    /// Whether any admitted run of `job` has not completed yet
    pub fn is_active(&self, job: &str) -> bool {
        self.lock().active.values().any(|name| name == job)
    }

    /// Names of all runs in flight, slot holder included
    pub fn active_jobs(&self) -> Vec<String> {
        self.lock().active.values().cloned().collect()
    }

    pub fn running(&self) -> Option<RunningState> {
        self.lock().running.clone()
    }

    pub fn batch_mode(&self) -> bool {
        self.lock().batch_mode
    }

    pub fn set_batch_mode(&self, enabled: bool) {
        self.lock().batch_mode = enabled;
    }

    /// Operator escape hatch: empty the slot, forget every active run and
    /// leave batch mode
    ///
    /// Runs still in flight keep their tokens; their later completion no
    /// longer matches anything and leaves the gate alone.
    pub fn force_reset(&self) -> Option<RunningState> {
        let mut inner = self.lock();
        inner.batch_mode = false;
        let forgotten = std::mem::take(&mut inner.active);
        if !forgotten.is_empty() {
            tracing::warn!(
                runs = ?forgotten.values().collect::<Vec<_>>(),
                "Forgetting active runs"
            );
        }
        inner.running.take()
    }

    /// Admit a run whose token is completed when the guard drops
    pub fn admit_guarded(&self, job: &str, origin: Origin) -> Result<RunGuard<'_>> {
        let token = self.admit(job, origin)?;
        Ok(RunGuard { gate: self, token })
    }

    /// Admit a batch and switch batch mode on
    ///
    /// Admission follows `origin` like any other run. The guard switches
    /// batch mode off and completes the batch's token on drop, whatever
    /// path leaves the batch.
    pub fn enter_batch(self: &Arc<Self>, job: &str, origin: Origin) -> Result<BatchModeGuard> {
        let token = self.admit(job, origin)?;
        self.set_batch_mode(true);
        tracing::info!(job, %token, "Batch mode on");
        Ok(BatchModeGuard {
            gate: Arc::clone(self),
            token,
        })
    }
}

/// Holds batch mode on for the lifetime of a batch
#[derive(Debug)]
pub struct BatchModeGuard {
    gate: Arc<Gate>,
    token: RunToken,
}

impl BatchModeGuard {
    pub fn token(&self) -> RunToken {
        self.token
    }
}

impl Drop for BatchModeGuard {
    fn drop(&mut self) {
        self.gate.set_batch_mode(false);
        self.gate.complete(self.token);
        tracing::info!(token = %self.token, "Batch mode off");
    }
}

/// Completes one admitted run on drop, including unwinding
#[derive(Debug)]
pub struct RunGuard<'a> {
    gate: &'a Gate,
    token: RunToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> RunToken {
        self.token
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.gate.complete(self.token);
    }
}
