// Pipeline Notifications
// Delivers the final pipeline status to external channels (webhooks, logs)

use crate::execution::scheduler::{JobRun, JobStatus, PipelineStatus};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while delivering a notification
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Webhook returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Per-job line of a pipeline summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub stage: String,
    pub status: JobStatus,
    pub allow_failure: bool,
    pub failure: Option<String>,
}

impl From<&JobRun> for JobSummary {
    fn from(run: &JobRun) -> Self {
        Self {
            name: run.job.clone(),
            stage: run.stage.clone(),
            status: run.status,
            allow_failure: run.allow_failure,
            failure: run
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .or_else(|| run.skip_reason.clone()),
        }
    }
}

/// What notifiers receive when a pipeline reaches its final status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Branch or tag the pipeline ran for
    pub ref_name: String,
    /// Trigger source (`push`, `merge_request_event`, `schedule`, ...)
    pub source: String,
    pub commit_sha: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobSummary>,
}

impl PipelineSummary {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Jobs with the given status
    pub fn jobs_with_status(&self, status: JobStatus) -> impl Iterator<Item = &JobSummary> {
        self.jobs.iter().filter(move |j| j.status == status)
    }

    /// One-line description used by log output and chat-style channels
    pub fn headline(&self) -> String {
        let failed: Vec<&str> = self
            .jobs_with_status(JobStatus::Failed)
            .map(|j| j.name.as_str())
            .collect();
        let mut line = format!(
            "pipeline {} for {} {} in {:.1}s",
            self.pipeline_id,
            self.ref_name,
            self.status,
            self.duration().as_secs_f64()
        );
        if !failed.is_empty() {
            line.push_str(&format!(" (failed: {})", failed.join(", ")));
        }
        line
    }
}

/// A channel that is told about finished pipelines
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &str;

    async fn send(&self, summary: &PipelineSummary) -> Result<(), NotificationError>;
}

/// Posts the summary as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(url, client)
    }

    /// Webhook notifier with a custom HTTP client (timeouts, proxies, TLS)
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, summary: &PipelineSummary) -> Result<(), NotificationError> {
        let response = self.client.post(&self.url).json(summary).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Writes the summary headline to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, summary: &PipelineSummary) -> Result<(), NotificationError> {
        info!(
            pipeline = %summary.pipeline_id,
            status = %summary.status,
            jobs = summary.jobs.len(),
            "{}",
            summary.headline()
        );
        Ok(())
    }
}
