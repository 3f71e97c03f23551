// Execution Events
// Progress reporting and event types for pipeline execution

use crate::execution::scheduler::{FailureCause, JobStatus, PipelineStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted {
        pipeline_id: String,
        total_jobs: usize,
        stages: Vec<String>,
    },

    /// Pipeline reached a final (or blocked) status
    PipelineCompleted {
        pipeline_id: String,
        status: PipelineStatus,
        duration: Duration,
    },

    /// A job moved to a new state without running (eligible, manual, skipped, canceled)
    JobStatusChanged {
        stage_name: String,
        job_name: String,
        status: JobStatus,
        reason: Option<String>,
    },

    /// Job execution attempt started
    JobStarted {
        stage_name: String,
        job_name: String,
        attempt: u32,
    },

    /// Job output (stdout/stderr)
    JobOutput {
        job_name: String,
        output: String,
        is_error: bool,
    },

    /// Job execution completed
    JobCompleted {
        stage_name: String,
        job_name: String,
        status: JobStatus,
        duration: Duration,
        failure: Option<FailureCause>,
    },

    /// Artifact written to the store
    ArtifactStored {
        job_name: String,
        key: String,
        size: usize,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a pipeline started event
    pub fn pipeline_started(id: impl Into<String>, total_jobs: usize, stages: Vec<String>) -> Self {
        Self::PipelineStarted {
            pipeline_id: id.into(),
            total_jobs,
            stages,
        }
    }

    /// Create a pipeline completed event
    pub fn pipeline_completed(
        id: impl Into<String>,
        status: PipelineStatus,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            pipeline_id: id.into(),
            status,
            duration,
        }
    }

    pub fn job_status_changed(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        status: JobStatus,
        reason: Option<String>,
    ) -> Self {
        Self::JobStatusChanged {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            status,
            reason,
        }
    }

    /// Create a job started event
    pub fn job_started(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self::JobStarted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            attempt,
        }
    }

    /// Create a job output event
    pub fn job_output(job_name: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Self::JobOutput {
            job_name: job_name.into(),
            output: output.into(),
            is_error,
        }
    }

    /// Create a job completed event
    pub fn job_completed(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        status: JobStatus,
        duration: Duration,
        failure: Option<FailureCause>,
    ) -> Self {
        Self::JobCompleted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            status,
            duration,
            failure,
        }
    }

    pub fn artifact_stored(job_name: impl Into<String>, key: impl Into<String>, size: usize) -> Self {
        Self::ArtifactStored {
            job_name: job_name.into(),
            key: key.into(),
            size,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_name,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_name,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
