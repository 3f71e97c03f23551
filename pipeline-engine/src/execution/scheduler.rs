// Job Scheduler
// JobRun state machine: stage barriers, needs, manual gates, skips and cancellation

use crate::execution::graph::{Edge, EdgeKind, JobGraph, JobNode};
use crate::parser::models::When;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Status of a single job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dependencies
    Pending,
    /// Dependencies satisfied, waiting for an executor slot
    Eligible,
    Running,
    /// Manual job waiting for `play`
    ManualWait,
    Success,
    Failed,
    /// Never ran because an upstream job failed, was skipped or canceled
    Skipped,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Skipped | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Eligible => "eligible",
            JobStatus::Running => "running",
            JobStatus::ManualWait => "manual",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a job run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// Script exited non-zero (`None` when killed by a signal)
    Script { exit_code: Option<i32> },
    /// Job exceeded its timeout
    Timeout,
    /// Runtime could not run the job after all retries
    Infrastructure { message: String },
    /// A declared artifact dependency could not be restored
    ArtifactRestore { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Script {
                exit_code: Some(code),
            } => write!(f, "script failed with exit code {}", code),
            FailureCause::Script { exit_code: None } => write!(f, "script was terminated"),
            FailureCause::Timeout => write!(f, "job timed out"),
            FailureCause::Infrastructure { message } => {
                write!(f, "infrastructure error: {}", message)
            }
            FailureCause::ArtifactRestore { message } => {
                write!(f, "artifact restore failed: {}", message)
            }
        }
    }
}

/// One job bound to one pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job: String,
    pub stage: String,
    pub status: JobStatus,
    pub when: When,
    pub allow_failure: bool,
    /// Execution attempts (retries included)
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureCause>,
    /// Keys of artifacts produced by this run
    pub artifacts: Vec<String>,
    pub skip_reason: Option<String>,
}

impl JobRun {
    fn new(node: &JobNode) -> Self {
        Self {
            job: node.name.clone(),
            stage: node.stage.clone(),
            status: JobStatus::Pending,
            when: node.when,
            allow_failure: node.allow_failure,
            attempts: 0,
            started_at: None,
            finished_at: None,
            failure: None,
            artifacts: Vec::new(),
            skip_reason: None,
        }
    }

    pub fn is_required(&self) -> bool {
        !self.allow_failure
    }

    /// Wall-clock time between start and finish
    pub fn duration(&self) -> Option<std::time::Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }

    /// Whether downstream jobs may proceed past this run
    fn permits_dependents(&self) -> bool {
        match self.status {
            JobStatus::Success => true,
            JobStatus::Failed => self.allow_failure,
            _ => false,
        }
    }

    /// Whether downstream on_success jobs can never run
    fn blocks_dependents(&self) -> bool {
        match self.status {
            JobStatus::Failed => !self.allow_failure,
            JobStatus::Skipped | JobStatus::Canceled => true,
            _ => false,
        }
    }

    /// A manual job that does not hold up its stage
    fn is_open_gate(&self) -> bool {
        self.status == JobStatus::ManualWait && self.allow_failure
    }
}

/// Result of a finished execution, reported back by the executor pool
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub failure: Option<FailureCause>,
    pub attempts: u32,
    pub artifacts: Vec<String>,
}

impl RunResult {
    pub fn success(attempts: u32) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    pub fn failed(cause: FailureCause, attempts: u32) -> Self {
        Self {
            failure: Some(cause),
            attempts,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Overall pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    /// Required manual gates remain and nothing else can progress
    Blocked,
    Success,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Blocked => "blocked",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == PipelineStatus::Success
    }

    /// Success, Failed or Canceled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success | PipelineStatus::Failed | PipelineStatus::Canceled
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned for control signals the scheduler cannot honour
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job '{0}' is not part of this pipeline")]
    UnknownJob(String),

    #[error("job '{0}' is not a manual job")]
    NotManual(String),

    #[error("job '{job}' cannot be played while {status}")]
    NotPlayable { job: String, status: JobStatus },

    #[error("pipeline was canceled")]
    PipelineCanceled,
}

/// Drives JobRuns through their state machine
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<JobGraph>,
    runs: Vec<JobRun>,
    approvals: HashSet<usize>,
    canceled: bool,
}

impl Scheduler {
    pub fn new(graph: Arc<JobGraph>) -> Self {
        let runs = graph.nodes().iter().map(JobRun::new).collect();
        Self {
            graph,
            runs,
            approvals: HashSet::new(),
            canceled: false,
        }
    }

    pub fn graph(&self) -> &Arc<JobGraph> {
        &self.graph
    }

    pub fn runs(&self) -> &[JobRun] {
        &self.runs
    }

    pub fn run(&self, index: usize) -> &JobRun {
        &self.runs[index]
    }

    pub fn into_runs(self) -> Vec<JobRun> {
        self.runs
    }

    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.graph.index_of(job).map(|i| self.runs[i].status)
    }

    /// Move Pending jobs whose dependencies settled to Eligible, ManualWait
    /// or Skipped. Returns the changed jobs with their new status.
    pub fn advance(&mut self) -> Vec<(usize, JobStatus)> {
        let mut changes = Vec::new();
        if self.canceled {
            return changes;
        }

        let order: Vec<usize> = self
            .graph
            .topological_order()
            .iter()
            .map(|n| n.index)
            .collect();

        for index in order {
            let next = match self.runs[index].status {
                JobStatus::Pending => self.next_status(index),
                JobStatus::ManualWait if self.approvals.contains(&index) => {
                    Some((JobStatus::Eligible, None))
                }
                _ => None,
            };

            if let Some((status, reason)) = next {
                let run = &mut self.runs[index];
                run.status = status;
                if status == JobStatus::Skipped {
                    run.skip_reason = reason;
                    run.finished_at = Some(Utc::now());
                }
                tracing::debug!(job = %run.job, status = %status, "job status changed");
                changes.push((index, status));
            }
        }

        changes
    }

    fn next_status(&self, index: usize) -> Option<(JobStatus, Option<String>)> {
        let node = self.graph.node(index);
        let deps = &node.dependencies;

        if node.when == When::Always {
            let settled = deps.iter().all(|edge| {
                let dep = &self.runs[edge.upstream];
                dep.status.is_terminal() || dep.is_open_gate()
            });
            return settled.then_some((JobStatus::Eligible, None));
        }

        if let Some(edge) = deps
            .iter()
            .find(|edge| self.runs[edge.upstream].blocks_dependents())
        {
            // Manual jobs are never skipped; they wait for play or cancel
            if node.when == When::Manual {
                return self
                    .approvals
                    .contains(&index)
                    .then_some((JobStatus::Eligible, None));
            }
            let dep = &self.runs[edge.upstream];
            return Some((
                JobStatus::Skipped,
                Some(format!("upstream job '{}' {}", dep.job, dep.status)),
            ));
        }

        if !deps.iter().all(|edge| self.edge_satisfied(edge)) {
            return None;
        }

        if node.when == When::Manual && !self.approvals.contains(&index) {
            Some((JobStatus::ManualWait, None))
        } else {
            Some((JobStatus::Eligible, None))
        }
    }

    /// An allow_failure job only holds a stage barrier until it leaves
    /// Pending; after that its outcome no longer matters downstream.
    fn edge_satisfied(&self, edge: &Edge) -> bool {
        let dep = &self.runs[edge.upstream];
        match edge.kind {
            EdgeKind::Barrier if !dep.is_required() => dep.status != JobStatus::Pending,
            _ => dep.permits_dependents(),
        }
    }

    /// Hand out every Eligible job, marking it Running
    pub fn take_eligible(&mut self) -> Vec<usize> {
        if self.canceled {
            return Vec::new();
        }

        let eligible: Vec<usize> = self
            .graph
            .topological_order()
            .iter()
            .map(|n| n.index)
            .filter(|&i| self.runs[i].status == JobStatus::Eligible)
            .collect();

        let now = Utc::now();
        for &index in &eligible {
            let run = &mut self.runs[index];
            run.status = JobStatus::Running;
            run.started_at = Some(now);
        }
        eligible
    }

    /// Approve a manual job. Jobs still Pending keep the approval and start
    /// as soon as their dependencies are satisfied.
    pub fn play(&mut self, job: &str) -> Result<(), SchedulerError> {
        if self.canceled {
            return Err(SchedulerError::PipelineCanceled);
        }
        let index = self
            .graph
            .index_of(job)
            .ok_or_else(|| SchedulerError::UnknownJob(job.to_string()))?;
        let run = &self.runs[index];

        if run.when != When::Manual {
            return Err(SchedulerError::NotManual(job.to_string()));
        }
        if !matches!(run.status, JobStatus::Pending | JobStatus::ManualWait) {
            return Err(SchedulerError::NotPlayable {
                job: job.to_string(),
                status: run.status,
            });
        }

        tracing::info!(job, "manual job approved");
        self.approvals.insert(index);
        Ok(())
    }

    /// Record the outcome of a Running job
    pub fn complete(&mut self, index: usize, result: RunResult) -> JobStatus {
        let run = &mut self.runs[index];
        if run.status != JobStatus::Running {
            return run.status;
        }

        run.status = if result.failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Success
        };
        run.failure = result.failure;
        run.attempts = result.attempts;
        run.artifacts = result.artifacts;
        run.finished_at = Some(Utc::now());
        run.status
    }

    /// Mark a Running job that was aborted as Canceled
    pub fn mark_canceled(&mut self, index: usize) {
        let run = &mut self.runs[index];
        if run.status == JobStatus::Running {
            run.status = JobStatus::Canceled;
            run.finished_at = Some(Utc::now());
        }
    }

    /// Cancel the pipeline: every job that has not started becomes Canceled.
    /// Returns the Running jobs, which the caller terminates.
    pub fn cancel(&mut self) -> Vec<usize> {
        self.canceled = true;
        let now = Utc::now();
        let mut running = Vec::new();

        for (index, run) in self.runs.iter_mut().enumerate() {
            match run.status {
                JobStatus::Pending | JobStatus::Eligible | JobStatus::ManualWait => {
                    run.status = JobStatus::Canceled;
                    run.finished_at = Some(now);
                }
                JobStatus::Running => running.push(index),
                _ => {}
            }
        }

        running
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// A stage is closed when every required job in it has succeeded.
    /// allow_failure jobs never hold it open, whatever their status.
    pub fn stage_closed(&self, stage: &str) -> bool {
        self.graph.jobs_in_stage(stage).all(|node| {
            let run = &self.runs[node.index];
            !run.is_required() || run.permits_dependents()
        })
    }

    /// Nothing is running or waiting for a slot
    pub fn is_settled(&self) -> bool {
        !self
            .runs
            .iter()
            .any(|r| matches!(r.status, JobStatus::Running | JobStatus::Eligible))
    }

    /// Some manual job can still be played
    pub fn has_manual_wait(&self) -> bool {
        self.runs.iter().any(|r| match r.status {
            JobStatus::ManualWait => true,
            JobStatus::Pending => r.when == When::Manual,
            _ => false,
        })
    }

    pub fn running_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == JobStatus::Running)
            .count()
    }

    /// Pipeline status derived from the job runs
    pub fn pipeline_status(&self) -> PipelineStatus {
        if self.canceled {
            return PipelineStatus::Canceled;
        }
        if self
            .runs
            .iter()
            .any(|r| r.status == JobStatus::Failed && r.is_required())
        {
            return PipelineStatus::Failed;
        }
        if !self.is_settled() {
            return PipelineStatus::Running;
        }
        if self
            .runs
            .iter()
            .any(|r| r.is_required() && !r.status.is_terminal())
        {
            return PipelineStatus::Blocked;
        }
        PipelineStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::PlannedJob;
    use crate::parser::models::{JobSpec, Need};

    use proptest::prelude::*;
    use std::collections::HashSet;

    struct JobDef {
        name: &'static str,
        stage: &'static str,
        when: When,
        allow_failure: bool,
        needs: Option<Vec<&'static str>>,
    }

    fn job(name: &'static str, stage: &'static str) -> JobDef {
        JobDef {
            name,
            stage,
            when: When::OnSuccess,
            allow_failure: false,
            needs: None,
        }
    }

    impl JobDef {
        fn manual(mut self) -> Self {
            self.when = When::Manual;
            self
        }

        fn always(mut self) -> Self {
            self.when = When::Always;
            self
        }

        fn allow_failure(mut self, allow: bool) -> Self {
            self.allow_failure = allow;
            self
        }

        fn needs(mut self, needs: Vec<&'static str>) -> Self {
            self.needs = Some(needs);
            self
        }
    }

    fn scheduler(stages: &[&str], jobs: Vec<JobDef>) -> Scheduler {
        let stages: Vec<String> = stages.iter().map(|s| s.to_string()).collect();
        let planned = jobs
            .into_iter()
            .map(|def| {
                let mut spec = JobSpec::new(def.name, def.stage);
                spec.script = vec!["true".to_string()];
                spec.needs = def
                    .needs
                    .map(|n| n.into_iter().map(|s| Need::Job(s.to_string())).collect());
                PlannedJob {
                    spec,
                    when: def.when,
                    allow_failure: def.allow_failure,
                    variables: Default::default(),
                }
            })
            .collect();
        let graph = JobGraph::build(&stages, planned, &HashSet::new()).unwrap();
        Scheduler::new(Arc::new(graph))
    }

    fn status(s: &Scheduler, job: &str) -> JobStatus {
        s.status_of(job).unwrap()
    }

    fn start(s: &mut Scheduler) -> Vec<String> {
        s.advance();
        s.take_eligible()
            .into_iter()
            .map(|i| s.run(i).job.clone())
            .collect()
    }

    fn finish(s: &mut Scheduler, job: &str, ok: bool) {
        let index = s.graph().index_of(job).unwrap();
        let result = if ok {
            RunResult::success(1)
        } else {
            RunResult::failed(FailureCause::Script { exit_code: Some(1) }, 1)
        };
        s.complete(index, result);
    }

    #[test]
    fn test_stage_barrier_holds_next_stage() {
        let mut s = scheduler(
            &["build", "test"],
            vec![job("compile", "build"), job("unit", "test")],
        );

        assert_eq!(start(&mut s), vec!["compile"]);
        assert_eq!(status(&s, "unit"), JobStatus::Pending);
        assert!(!s.stage_closed("build"));

        finish(&mut s, "compile", true);
        assert!(s.stage_closed("build"));
        assert_eq!(start(&mut s), vec!["unit"]);
    }

    #[test]
    fn test_allow_failure_closes_stage() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("b", "build"),
                job("t1", "test").allow_failure(true),
                job("t2", "test"),
                job("d", "deploy"),
            ],
        );

        start(&mut s);
        finish(&mut s, "b", true);
        assert_eq!(start(&mut s), vec!["t1", "t2"]);
        finish(&mut s, "t1", false);
        assert!(!s.stage_closed("test"));
        finish(&mut s, "t2", true);
        assert!(s.stage_closed("test"));

        assert_eq!(start(&mut s), vec!["d"]);
        finish(&mut s, "d", true);
        assert_eq!(s.pipeline_status(), PipelineStatus::Success);
    }

    #[test]
    fn test_running_optional_job_does_not_hold_stage() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("b", "build"),
                job("t1", "test").allow_failure(true),
                job("t2", "test"),
                job("d", "deploy"),
            ],
        );

        start(&mut s);
        finish(&mut s, "b", true);
        assert_eq!(start(&mut s), vec!["t1", "t2"]);
        finish(&mut s, "t2", true);

        assert_eq!(status(&s, "t1"), JobStatus::Running);
        assert!(s.stage_closed("test"));
        s.advance();
        assert_eq!(status(&s, "d"), JobStatus::Eligible);
        assert_eq!(s.take_eligible().len(), 1);

        finish(&mut s, "d", true);
        assert_eq!(s.pipeline_status(), PipelineStatus::Running);
        finish(&mut s, "t1", false);
        assert_eq!(s.pipeline_status(), PipelineStatus::Success);
    }

    #[test]
    fn test_pending_optional_job_keeps_stage_order() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("b", "build"),
                job("t", "test").allow_failure(true),
                job("d", "deploy"),
            ],
        );

        assert_eq!(start(&mut s), vec!["b"]);
        assert!(s.stage_closed("test"));
        assert_eq!(status(&s, "d"), JobStatus::Pending);

        finish(&mut s, "b", true);
        assert_eq!(start(&mut s), vec!["t", "d"]);
    }

    #[test]
    fn test_failure_skips_later_stages() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("b", "build"),
                job("t1", "test"),
                job("t2", "test"),
                job("d", "deploy"),
            ],
        );

        start(&mut s);
        finish(&mut s, "b", false);
        s.advance();

        assert_eq!(status(&s, "t1"), JobStatus::Skipped);
        assert_eq!(status(&s, "t2"), JobStatus::Skipped);
        assert_eq!(status(&s, "d"), JobStatus::Skipped);
        assert!(s.take_eligible().is_empty());
        assert_eq!(s.pipeline_status(), PipelineStatus::Failed);
        assert!(s.run(1).skip_reason.as_deref().unwrap().contains("'b' failed"));
    }

    #[test]
    fn test_always_job_runs_after_failure() {
        let mut s = scheduler(
            &["build", "cleanup"],
            vec![job("b", "build"), job("c", "cleanup").always()],
        );

        start(&mut s);
        finish(&mut s, "b", false);
        assert_eq!(start(&mut s), vec!["c"]);
    }

    #[test]
    fn test_manual_wait_until_play() {
        let mut s = scheduler(
            &["build", "deploy"],
            vec![job("b", "build"), job("deploy", "deploy").manual()],
        );

        start(&mut s);
        finish(&mut s, "b", true);
        assert!(start(&mut s).is_empty());
        assert_eq!(status(&s, "deploy"), JobStatus::ManualWait);

        // No signal: it stays waiting
        for _ in 0..3 {
            assert!(start(&mut s).is_empty());
        }
        assert_eq!(status(&s, "deploy"), JobStatus::ManualWait);
        assert_eq!(s.pipeline_status(), PipelineStatus::Blocked);

        s.play("deploy").unwrap();
        assert_eq!(start(&mut s), vec!["deploy"]);
        finish(&mut s, "deploy", true);
        assert_eq!(s.pipeline_status(), PipelineStatus::Success);
    }

    #[test]
    fn test_manual_job_after_failure_waits_for_play() {
        let mut s = scheduler(
            &["build", "deploy", "verify"],
            vec![
                job("b", "build"),
                job("deploy", "deploy").manual(),
                job("smoke", "verify"),
            ],
        );

        start(&mut s);
        finish(&mut s, "b", false);
        assert!(start(&mut s).is_empty());

        assert_eq!(status(&s, "deploy"), JobStatus::Pending);
        assert_eq!(status(&s, "smoke"), JobStatus::Pending);
        assert!(s.is_settled());
        assert!(s.has_manual_wait());
        assert_eq!(s.pipeline_status(), PipelineStatus::Failed);

        s.play("deploy").unwrap();
        assert_eq!(start(&mut s), vec!["deploy"]);
        finish(&mut s, "deploy", true);
        assert_eq!(start(&mut s), vec!["smoke"]);
    }

    #[test]
    fn test_cancel_moves_blocked_manual_job_to_canceled() {
        let mut s = scheduler(
            &["build", "deploy", "verify"],
            vec![
                job("b", "build"),
                job("deploy", "deploy").manual(),
                job("smoke", "verify"),
            ],
        );

        start(&mut s);
        finish(&mut s, "b", false);
        s.advance();
        assert_eq!(status(&s, "deploy"), JobStatus::Pending);

        assert!(s.cancel().is_empty());
        assert_eq!(status(&s, "deploy"), JobStatus::Canceled);
        assert_eq!(status(&s, "smoke"), JobStatus::Canceled);
        assert!(!s.has_manual_wait());
    }

    #[test]
    fn test_optional_manual_does_not_block_barrier() {
        let mut s = scheduler(
            &["test", "deploy"],
            vec![
                job("t", "test"),
                job("review", "test").manual().allow_failure(true),
                job("d", "deploy"),
            ],
        );

        assert_eq!(start(&mut s), vec!["t"]);
        finish(&mut s, "t", true);
        assert_eq!(start(&mut s), vec!["d"]);
        assert_eq!(status(&s, "review"), JobStatus::ManualWait);
        assert!(s.stage_closed("test"));

        finish(&mut s, "d", true);
        assert_eq!(s.pipeline_status(), PipelineStatus::Success);
    }

    #[test]
    fn test_needs_waits_for_optional_manual() {
        let mut s = scheduler(
            &["test", "deploy"],
            vec![
                job("review", "test").manual().allow_failure(true),
                job("d", "deploy").needs(vec!["review"]),
            ],
        );

        assert!(start(&mut s).is_empty());
        assert_eq!(status(&s, "d"), JobStatus::Pending);
        assert_eq!(s.pipeline_status(), PipelineStatus::Blocked);
    }

    #[test]
    fn test_pre_approval() {
        let mut s = scheduler(
            &["build", "deploy"],
            vec![job("b", "build"), job("deploy", "deploy").manual()],
        );

        start(&mut s);
        s.play("deploy").unwrap();
        assert_eq!(status(&s, "deploy"), JobStatus::Pending);
        finish(&mut s, "b", true);
        assert_eq!(start(&mut s), vec!["deploy"]);
    }

    #[test]
    fn test_play_errors() {
        let mut s = scheduler(&["build"], vec![job("b", "build")]);
        assert_eq!(
            s.play("nope"),
            Err(SchedulerError::UnknownJob("nope".to_string()))
        );
        assert_eq!(s.play("b"), Err(SchedulerError::NotManual("b".to_string())));
    }

    #[test]
    fn test_cancel() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("b1", "build"),
                job("b2", "build"),
                job("t", "test"),
                job("gate", "deploy").manual().needs(vec![]),
            ],
        );

        start(&mut s);
        finish(&mut s, "b1", true);
        assert_eq!(status(&s, "gate"), JobStatus::ManualWait);

        let running = s.cancel();
        assert_eq!(running, vec![s.graph().index_of("b2").unwrap()]);
        assert_eq!(status(&s, "b1"), JobStatus::Success);
        assert_eq!(status(&s, "t"), JobStatus::Canceled);
        assert_eq!(status(&s, "gate"), JobStatus::Canceled);

        s.mark_canceled(running[0]);
        assert_eq!(status(&s, "b2"), JobStatus::Canceled);
        assert_eq!(s.pipeline_status(), PipelineStatus::Canceled);
        assert_eq!(s.play("gate"), Err(SchedulerError::PipelineCanceled));
    }

    #[test]
    fn test_needs_bypass_barrier() {
        let mut s = scheduler(
            &["build", "test", "deploy"],
            vec![
                job("fast", "build"),
                job("slow", "build"),
                job("t", "test").needs(vec!["fast"]),
            ],
        );

        assert_eq!(start(&mut s), vec!["fast", "slow"]);
        finish(&mut s, "fast", true);
        assert_eq!(start(&mut s), vec!["t"]);
        assert_eq!(status(&s, "slow"), JobStatus::Running);
    }

    proptest! {
        /// Drive random pipelines with random outcomes; stage closure and
        /// skip propagation must hold at every step.
        #[test]
        fn test_scheduler_invariants(
            shape in proptest::collection::vec((0usize..3, any::<bool>(), any::<bool>()), 1..12),
            outcomes in proptest::collection::vec(any::<bool>(), 12),
        ) {
            const STAGES: [&str; 3] = ["build", "test", "deploy"];
            const NAMES: [&str; 12] = ["j0", "j1", "j2", "j3", "j4", "j5", "j6", "j7", "j8", "j9", "j10", "j11"];

            let jobs: Vec<JobDef> = shape
                .iter()
                .enumerate()
                .map(|(i, (stage, allow, _))| job(NAMES[i], STAGES[*stage]).allow_failure(*allow))
                .collect();
            let mut s = scheduler(&STAGES, jobs);

            for _ in 0..shape.len() + 1 {
                let started = start(&mut s);

                for stage in STAGES {
                    if s.stage_closed(stage) {
                        for node in s.graph().jobs_in_stage(stage) {
                            let run = s.run(node.index);
                            prop_assert!(!(run.is_required() && !run.status.is_terminal()));
                        }
                    }
                }

                for job in started {
                    let index = s.graph().index_of(&job).unwrap();
                    // No job starts while a required dependency has failed
                    for edge in &s.graph().node(index).dependencies {
                        let dep = s.run(edge.upstream);
                        if dep.is_required() {
                            prop_assert!(dep.permits_dependents());
                        } else {
                            prop_assert!(!dep.blocks_dependents());
                            prop_assert!(dep.status != JobStatus::Pending);
                        }
                    }
                    finish(&mut s, &job, outcomes[index]);
                }
            }

            prop_assert!(s.is_settled());
            let failed_required = s.runs().iter().any(|r| r.status == JobStatus::Failed && r.is_required());
            let expected = if failed_required { PipelineStatus::Failed } else { PipelineStatus::Success };
            prop_assert_eq!(s.pipeline_status(), expected);
            for run in s.runs() {
                prop_assert!(run.status.is_terminal());
            }
        }
    }
}
