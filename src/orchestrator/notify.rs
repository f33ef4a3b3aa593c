//! Alert delivery
//!
//! Every terminal job outcome raises exactly one [`Alert::Finished`].
//! Dropped queue items and forced resets are alerted too. Delivery
//! failures are logged and never reach the job.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::common::config::AlertConfig;
use crate::common::{Error, Result};

use super::gate::{Origin, RunToken, RunningState};

/// Something an operator should hear about
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    Started {
        job: String,
        run_id: RunToken,
        origin: Origin,
        collection: Option<String>,
    },
    Finished {
        job: String,
        run_id: RunToken,
        success: bool,
        exit_code: i32,
        duration_ms: u64,
        summary: String,
    },
    QueueDropped {
        job: String,
        retries: u32,
    },
    ForcedReset {
        previous: Option<RunningState>,
    },
}

impl Alert {
    /// Human-readable one-liner
    pub fn message(&self) -> String {
        match self {
            Alert::Started {
                job, collection, ..
            } => match collection {
                Some(c) => format!("Job '{}' started ({})", job, c),
                None => format!("Job '{}' started", job),
            },
            Alert::Finished {
                job,
                success,
                duration_ms,
                summary,
                ..
            } => format!(
                "Job '{}' {} in {}ms: {}",
                job,
                if *success { "succeeded" } else { "failed" },
                duration_ms,
                summary
            ),
            Alert::QueueDropped { job, retries } => {
                Error::QueueRetriesExhausted {
                    job: job.clone(),
                    retries: *retries,
                }
                .to_string()
            }
            Alert::ForcedReset { previous } => match previous {
                Some(p) => format!("Running state forcibly cleared (was '{}')", p.job_name),
                None => "Running state forcibly cleared (was empty)".to_string(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            Alert::Finished { success, .. } => !success,
            Alert::QueueDropped { .. } | Alert::ForcedReset { .. } => true,
            Alert::Started { .. } => false,
        }
    }
}

/// Receives alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert; errors are reported to the caller for logging only
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        if alert.is_failure() {
            tracing::warn!(alert = %alert.message(), "Alert");
        } else {
            tracing::info!(alert = %alert.message(), "Alert");
        }
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    config: AlertConfig,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, config: AlertConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            config,
        }
    }

    /// Whether the configured toggles let this alert through
    pub fn wants(&self, alert: &Alert) -> bool {
        match alert {
            Alert::Started { .. } => self.config.on_start,
            Alert::Finished { success: true, .. } => self.config.on_success,
            Alert::Finished { success: false, .. } => self.config.on_error,
            Alert::QueueDropped { .. } | Alert::ForcedReset { .. } => self.config.on_error,
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: String,
    #[serde(flatten)]
    alert: &'a Alert,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        if !self.wants(alert) {
            return Ok(());
        }
        let payload = WebhookPayload {
            text: alert.message(),
            alert,
        };
        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", "scenario-harness")
            .timeout(self.config.timeout())
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Build the notifier the configuration asks for
pub fn from_config(config: &AlertConfig) -> Box<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.clone(), config.clone())),
        None => Box::new(LogNotifier),
    }
}

/// Deliver an alert within `limit`, logging any failure
pub async fn deliver(notifier: &dyn Notifier, alert: Alert, limit: Duration) {
    match tokio::time::timeout(limit, notifier.notify(&alert)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(error = %e, alert = %alert.message(), "Alert delivery failed");
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                alert = %alert.message(),
                "Alert delivery timed out"
            );
        }
    }
}
