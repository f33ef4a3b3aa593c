//! Schedule queue
//!
//! FIFO of job names fed by the scheduler, idempotent per name. A single
//! worker task drains it: kicks arriving while a drain is in progress are
//! coalesced into the next one. A head item whose job is still running is
//! retried after a backoff and dropped once its retries run out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::gate::Origin;
use super::notify::Alert;
use super::report::JobEvent;
use super::Inner;

/// A pending scheduled run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub job_name: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Queue item as reported by status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemStatus {
    pub job_name: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub waiting_ms: u64,
}

/// Queue snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub length: usize,
    pub processing: bool,
    pub items: Vec<QueueItemStatus>,
}

/// What the worker should do with the head item
#[derive(Debug, Clone, PartialEq)]
pub enum HeadAction {
    /// Queue is empty
    Idle,
    /// Head was popped and should be dispatched
    Dispatch(QueueItem),
    /// Head stays; wait and look again
    Backoff { job_name: String, retry_count: u32 },
    /// Head exceeded its retries and was removed
    Dropped(QueueItem),
}

#[derive(Debug)]
pub struct ScheduleQueue {
    items: Mutex<VecDeque<QueueItem>>,
    processing: AtomicBool,
    kick: mpsc::UnboundedSender<()>,
}

impl ScheduleQueue {
    /// Create the queue and the receiving end of its kick channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (kick, kicks) = mpsc::unbounded_channel();
        let queue = Self {
            items: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            kick,
        };
        (queue, kicks)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `job_name` unless it is already queued
    pub fn push(&self, job_name: &str) -> bool {
        let mut items = self.lock();
        if items.iter().any(|item| item.job_name == job_name) {
            return false;
        }
        items.push_back(QueueItem {
            job_name: job_name.to_string(),
            enqueued_at: Utc::now(),
            retry_count: 0,
        });
        true
    }

    /// Wake the worker
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }

    /// Sender that wakes the worker without holding the queue
    pub fn kicker(&self) -> mpsc::UnboundedSender<()> {
        self.kick.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Decide on the head item under one lock
    ///
    /// `busy` tells whether a job may not be dispatched yet. A busy head
    /// has its retry count bumped; past `max_retries` it is removed.
    pub fn next_action(&self, busy: impl Fn(&str) -> bool, max_retries: u32) -> HeadAction {
        let mut items = self.lock();
        let Some(head) = items.front_mut() else {
            return HeadAction::Idle;
        };

        if !busy(&head.job_name) {
            return items
                .pop_front()
                .map(HeadAction::Dispatch)
                .unwrap_or(HeadAction::Idle);
        }

        head.retry_count += 1;
        if head.retry_count > max_retries {
            return items
                .pop_front()
                .map(HeadAction::Dropped)
                .unwrap_or(HeadAction::Idle);
        }
        HeadAction::Backoff {
            job_name: head.job_name.clone(),
            retry_count: head.retry_count,
        }
    }

    pub fn status(&self) -> QueueStatus {
        let now = Utc::now();
        let items: Vec<_> = self
            .lock()
            .iter()
            .map(|item| QueueItemStatus {
                job_name: item.job_name.clone(),
                enqueued_at: item.enqueued_at,
                retry_count: item.retry_count,
                waiting_ms: (now - item.enqueued_at).num_milliseconds().max(0) as u64,
            })
            .collect();
        QueueStatus {
            length: items.len(),
            processing: self.is_processing(),
            items,
        }
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Worker loop; ends when the orchestrator is dropped or shut down
pub(super) async fn worker(inner: Weak<Inner>, mut kicks: mpsc::UnboundedReceiver<()>) {
    while kicks.recv().await.is_some() {
        while kicks.try_recv().is_ok() {}

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.cancel.is_cancelled() {
            break;
        }
        drain(&inner).await;
    }
    tracing::debug!("Schedule queue worker stopped");
}

async fn drain(inner: &Arc<Inner>) {
    let queue = &inner.queue;
    if queue.processing.swap(true, Ordering::SeqCst) {
        return;
    }
    let settings = &inner.config.orchestrator;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let busy = |job: &str| inner.gate.is_active(job) && !inner.gate.batch_mode();

        match queue.next_action(busy, settings.max_retries) {
            HeadAction::Idle => break,
            HeadAction::Backoff {
                job_name,
                retry_count,
            } => {
                tracing::info!(
                    job = %job_name,
                    retry = retry_count,
                    max_retries = settings.max_retries,
                    backoff_ms = settings.backoff_ms,
                    "Queued job still running, backing off"
                );
                if !pause(settings.backoff(), &inner.cancel).await {
                    break;
                }
            }
            HeadAction::Dropped(item) => {
                tracing::warn!(
                    job = %item.job_name,
                    retries = settings.max_retries,
                    "Dropping queued job, retries exhausted"
                );
                inner.events.publish(JobEvent::QueueChanged {
                    length: queue.len(),
                });
                inner.alert(
                    Alert::QueueDropped {
                        job: item.job_name,
                        retries: settings.max_retries,
                    },
                )
                .await;
            }
            HeadAction::Dispatch(item) => {
                inner.events.publish(JobEvent::QueueChanged {
                    length: queue.len(),
                });
                let waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds();
                match inner.submit(&item.job_name, Origin::Scheduled) {
                    Ok(handle) => {
                        tracing::info!(
                            job = %item.job_name,
                            run = %handle.run_id(),
                            waited_ms,
                            "Dispatched scheduled job"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(job = %item.job_name, error = %e, "Scheduled job rejected");
                    }
                }
                if !pause(settings.dispatch_gap(), &inner.cancel).await {
                    break;
                }
            }
        }
    }

    queue.processing.store(false, Ordering::SeqCst);
}
