//! Run notifications: a policy deciding which outcomes are sent and the
//! sinks they are sent to.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};

use crate::pipeline::error::PipelineError;
use crate::pipeline::report::{RunOutcome, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoticePolicy {
    /// Success events carry the record count and duration.
    #[default]
    Always,
    OnlyFailedSkipped,
    OnlyFailed,
    Disable,
}

impl NoticePolicy {
    pub fn should_notify(&self, outcome: RunOutcome) -> bool {
        match self {
            Self::Always => true,
            Self::OnlyFailedSkipped => outcome != RunOutcome::Succeeded,
            Self::OnlyFailed => outcome == RunOutcome::Failed,
            Self::Disable => false,
        }
    }
}

impl FromStr for NoticePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "always" => Ok(Self::Always),
            "only_failed_skipped" => Ok(Self::OnlyFailedSkipped),
            "only_failed" => Ok(Self::OnlyFailed),
            "disable" | "disabled" | "off" => Ok(Self::Disable),
            other => Err(PipelineError::Config(format!("unknown notice policy {other:?}"))),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<()>;
}

/// Default sink: one structured log line per run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, report: &RunReport) -> Result<()> {
        match report.outcome {
            RunOutcome::Failed => error!(
                target: "collector::notice",
                fetcher = %report.fetcher,
                batch = %report.batch,
                retries = report.retries,
                record_count = report.record_count,
                message = report.message.as_deref().unwrap_or(""),
                "run failed"
            ),
            RunOutcome::Skipped => warn!(
                target: "collector::notice",
                fetcher = %report.fetcher,
                batch = %report.batch,
                message = report.message.as_deref().unwrap_or(""),
                "run skipped"
            ),
            RunOutcome::Succeeded => info!(
                target: "collector::notice",
                fetcher = %report.fetcher,
                batch = %report.batch,
                record_count = report.record_count,
                duration_ms = report.duration_ms,
                "run succeeded"
            ),
        }
        Ok(())
    }
}

/// Posts a JSON card to a chat-style webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn card(report: &RunReport) -> serde_json::Value {
        json!({
            "title": format!("{} {}", report.fetcher, report.outcome),
            "outcome": report.outcome,
            "fetcher": report.fetcher,
            "collection": report.collection,
            "batch": report.batch.to_string(),
            "record_count": report.record_count,
            "item_errors": report.item_errors,
            "duration_ms": report.duration_ms,
            "retries": report.retries,
            "message": report.message,
            "run_id": report.run_id,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &RunReport) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&Self::card(report))
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}
