//! Lifecycle event stream
//!
//! [`EventBus`] is a typed publish/subscribe hub backed by a
//! `tokio::sync::broadcast` channel. The scenario runner publishes
//! [`RunEvent`]s on it; live log streaming and report rendering subscribe
//! without the runner knowing about them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::scenario::ScenarioInfo;

use super::result::{ScenarioSummary, StepResult};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest un-consumed messages are dropped and
/// slow receivers observe `RecvError::Lagged`. Publishing with no
/// subscribers is not an error.
#[derive(Debug)]
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: T) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events emitted by the scenario runner, in order:
/// `ScenarioStart`, then per step `StepStart`, any output chunks and
/// `StepComplete` or `StepError`, and finally `ScenarioEnd`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEvent {
    ScenarioStart {
        info: ScenarioInfo,
        steps: usize,
        timestamp: DateTime<Utc>,
    },
    StepStart {
        index: usize,
        name: String,
        command: String,
        command_line: String,
        timestamp: DateTime<Utc>,
    },
    StdoutChunk {
        index: usize,
        text: String,
    },
    StderrChunk {
        index: usize,
        text: String,
    },
    StepComplete {
        result: Box<StepResult>,
    },
    StepError {
        index: usize,
        name: String,
        error: String,
    },
    ScenarioEnd {
        info: ScenarioInfo,
        summary: ScenarioSummary,
        success: bool,
    },
}

impl RunEvent {
    /// Wrap a decoded output chunk
    pub fn output(index: usize, stream: OutputStream, text: String) -> Self {
        match stream {
            OutputStream::Stdout => RunEvent::StdoutChunk { index, text },
            OutputStream::Stderr => RunEvent::StderrChunk { index, text },
        }
    }

    /// Short kebab-case name, matching the serialized tag
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::ScenarioStart { .. } => "scenario-start",
            RunEvent::StepStart { .. } => "step-start",
            RunEvent::StdoutChunk { .. } => "stdout-chunk",
            RunEvent::StderrChunk { .. } => "stderr-chunk",
            RunEvent::StepComplete { .. } => "step-complete",
            RunEvent::StepError { .. } => "step-error",
            RunEvent::ScenarioEnd { .. } => "scenario-end",
        }
    }
}
