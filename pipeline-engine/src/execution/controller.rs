// Pipeline Controller
// Top-level pipeline state machine: rules -> graph -> scheduler/executor loop -> notifications

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{JobGraph, JobNode};
use crate::execution::scheduler::{
    FailureCause, JobRun, JobStatus, PipelineStatus, RunResult, Scheduler,
};
use crate::notify::{JobSummary, Notifier, PipelineSummary};
use crate::parser::models::PipelineDefinition;
use crate::parser::PipelineValidator;
use crate::rules::{RuleContext, RuleDecision, RuleError, RuleEvaluator, TriggerEvent};
use crate::runners::{ArtifactSource, ContainerRuntime, ExecutorPool, JobOutcome, JobTask};
use crate::store::{artifact_key, ArtifactKind, ArtifactStore};
use crate::utils::{expand_variables, parse_duration, short_id};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// What started a pipeline
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    /// Commit being built
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub event: TriggerEvent,
    pub schedule: bool,
    /// Paths changed by the commit; `None` when unknown (every `changes:` matches)
    pub changed_paths: Option<Vec<String>>,
    /// Variables supplied with the trigger
    pub variables: HashMap<String, String>,
    /// Manual jobs approved up front
    pub play: Vec<String>,
}

impl Trigger {
    pub fn for_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Default::default()
        }
    }

    pub fn for_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    pub fn with_event(mut self, event: TriggerEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_schedule(mut self, schedule: bool) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = Some(paths);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Approve a manual job before the pipeline starts
    pub fn with_play(mut self, job: impl Into<String>) -> Self {
        self.play.push(job.into());
        self
    }

    /// The immutable rule context for this trigger
    pub fn rule_context(&self, config: &EngineConfig) -> RuleContext {
        RuleContext {
            branch: self.branch.clone(),
            tag: self.tag.clone(),
            commit_sha: self.commit_sha.clone(),
            event: self.event,
            schedule: self.schedule,
            default_branch: config.default_branch.clone(),
            changed_paths: self.changed_paths.clone(),
            project_dir: Some(config.workspace_dir.clone()),
            variables: self.variables.clone(),
        }
    }
}

/// Signals accepted while a pipeline runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Approve a manual job
    Play(String),
    Cancel,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("pipeline is no longer running")]
    Closed,
}

/// Cloneable handle for steering a running pipeline
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl PipelineHandle {
    /// Approve a manual job
    pub fn play(&self, job: impl Into<String>) -> Result<(), ControlError> {
        self.tx
            .send(ControlSignal::Play(job.into()))
            .map_err(|_| ControlError::Closed)
    }

    /// Cancel the pipeline: running jobs are aborted, nothing new starts
    pub fn cancel(&self) -> Result<(), ControlError> {
        self.tx
            .send(ControlSignal::Cancel)
            .map_err(|_| ControlError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Final record of a pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Runs of every included job, in graph order
    pub runs: Vec<JobRun>,
    /// Jobs left out by rules, with the reason
    pub excluded: Vec<(String, String)>,
    /// Jobs whose rules could not be evaluated (also in `excluded`)
    pub rule_errors: Vec<RuleError>,
    /// Notifiers that failed, with their error
    pub notification_errors: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn run(&self, job: &str) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.job == job)
    }

    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.run(job).map(|r| r.status)
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Keys of every artifact the pipeline produced
    pub fn artifacts(&self) -> impl Iterator<Item = &str> {
        self.runs
            .iter()
            .flat_map(|r| r.artifacts.iter().map(String::as_str))
    }

    pub fn summary(&self, context: &RuleContext) -> PipelineSummary {
        PipelineSummary {
            pipeline_id: self.pipeline_id.clone(),
            status: self.status,
            ref_name: context.ref_name().to_string(),
            source: context.pipeline_source().to_string(),
            commit_sha: context.commit_sha.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            jobs: self.runs.iter().map(JobSummary::from).collect(),
        }
    }
}

/// Aborts the wrapped task when dropped, so aborting the supervising task
/// also stops the job it supervises
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one pipeline definition for a trigger
pub struct PipelineController {
    pipeline: Arc<PipelineDefinition>,
    config: EngineConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: ArtifactStore,
    notifiers: Vec<Arc<dyn Notifier>>,
    progress: Option<ProgressSender>,
    control: Option<mpsc::UnboundedReceiver<ControlSignal>>,
    control_tx: Option<mpsc::UnboundedSender<ControlSignal>>,
}

impl PipelineController {
    pub fn new(
        pipeline: PipelineDefinition,
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            config,
            runtime,
            store: ArtifactStore::in_memory(),
            notifiers: Vec::new(),
            progress: None,
            control: None,
            control_tx: None,
        }
    }

    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Handle for sending control signals to the run.
    ///
    /// The pipeline only waits for manual approvals while at least one
    /// handle is alive (and `wait_for_manual` is set).
    pub fn handle(&mut self) -> PipelineHandle {
        if let Some(tx) = &self.control_tx {
            return PipelineHandle { tx: tx.clone() };
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.control = Some(rx);
        self.control_tx = Some(tx.clone());
        PipelineHandle { tx }
    }

    /// Run the pipeline to a final status.
    ///
    /// Errors are returned only when the pipeline cannot start (invalid
    /// definition or graph, or no job included for this trigger). Job
    /// failures are reported through the returned `PipelineReport`.
    pub async fn run(mut self, trigger: Trigger) -> EngineResult<PipelineReport> {
        PipelineValidator::validate(&self.pipeline).map_err(EngineError::Validation)?;

        let context = trigger.rule_context(&self.config);
        let evaluation =
            RuleEvaluator::new(&context, &self.pipeline.variables).evaluate_pipeline(&self.pipeline);
        for err in &evaluation.errors {
            warn!(job = %err.job, "{}", err);
        }

        let graph = Arc::new(JobGraph::from_pipeline(&self.pipeline, &evaluation)?);
        if graph.is_empty() {
            return Err(EngineError::EmptyPipeline);
        }

        let excluded: Vec<(String, String)> = evaluation
            .decisions
            .iter()
            .filter_map(|(job, decision)| match decision {
                RuleDecision::Exclude { reason } => Some((job.clone(), reason.clone())),
                _ => None,
            })
            .collect();

        let pipeline_id = short_id();
        let started_at = Utc::now();
        let clock = Instant::now();

        match self.store.invalidate_expired(started_at).await {
            Ok(removed) if !removed.is_empty() => {
                debug!(count = removed.len(), "expired artifacts removed")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to remove expired artifacts"),
        }

        info!(
            pipeline = %pipeline_id,
            ref_name = context.ref_name(),
            source = context.pipeline_source(),
            jobs = graph.len(),
            "pipeline started"
        );
        self.progress.send_event(ExecutionEvent::pipeline_started(
            &pipeline_id,
            graph.len(),
            graph.active_stages().iter().map(|s| s.to_string()).collect(),
        ));

        let mut scheduler = Scheduler::new(graph.clone());
        for job in &trigger.play {
            if let Err(e) = scheduler.play(job) {
                warn!(job = %job, error = %e, "ignoring pre-approval");
            }
        }

        // Only the receiver is kept: the channel closes once every handle is dropped
        self.control_tx = None;
        let mut control = self.control.take();

        let mut pool = ExecutorPool::new(
            self.runtime.clone(),
            self.store.clone(),
            self.config.clone(),
        );
        if let Some(tx) = &self.progress {
            pool = pool.with_progress(tx.clone());
        }

        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();

        loop {
            self.dispatch(&pipeline_id, &context, &mut scheduler, &pool, &mut tasks);

            if scheduler.is_settled() {
                let can_wait = self.config.wait_for_manual
                    && control.is_some()
                    && scheduler.has_manual_wait()
                    && !scheduler.is_canceled();
                if !can_wait {
                    break;
                }
                debug!(pipeline = %pipeline_id, "waiting for manual jobs");
            }

            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => self.record_outcome(&mut scheduler, outcome),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => error!(error = %e, "job task failed"),
                    }
                }
                signal = recv_signal(&mut control), if control.is_some() => {
                    match signal {
                        Some(ControlSignal::Play(job)) => {
                            if let Err(e) = scheduler.play(&job) {
                                warn!(job = %job, error = %e, "play rejected");
                                self.progress.send_event(ExecutionEvent::warning(
                                    e.to_string(),
                                    Some(job),
                                ));
                            }
                        }
                        Some(ControlSignal::Cancel) => {
                            self.cancel(&mut scheduler, &mut tasks).await;
                        }
                        None => {
                            debug!(pipeline = %pipeline_id, "control channel closed");
                            control = None;
                        }
                    }
                }
                else => break,
            }
        }

        let status = scheduler.pipeline_status();
        let finished_at = Utc::now();
        info!(
            pipeline = %pipeline_id,
            status = %status,
            duration = ?clock.elapsed(),
            "pipeline finished"
        );
        self.progress.send_event(ExecutionEvent::pipeline_completed(
            &pipeline_id,
            status,
            clock.elapsed(),
        ));

        let mut report = PipelineReport {
            pipeline_id,
            status,
            runs: scheduler.into_runs(),
            excluded,
            rule_errors: evaluation.errors,
            notification_errors: Vec::new(),
            started_at,
            finished_at,
        };

        if status.is_terminal() {
            report.notification_errors = self.notify(&report.summary(&context)).await;
        }

        Ok(report)
    }

    /// Advance the scheduler and start every job that became eligible
    fn dispatch(
        &self,
        pipeline_id: &str,
        context: &RuleContext,
        scheduler: &mut Scheduler,
        pool: &ExecutorPool,
        tasks: &mut JoinSet<JobOutcome>,
    ) {
        for (index, status) in scheduler.advance() {
            let run = scheduler.run(index);
            match status {
                JobStatus::Skipped => info!(job = %run.job, reason = ?run.skip_reason, "job skipped"),
                JobStatus::ManualWait => info!(job = %run.job, "job waiting for manual action"),
                _ => debug!(job = %run.job, %status, "job status changed"),
            }
            self.progress.send_event(ExecutionEvent::job_status_changed(
                &run.stage,
                &run.job,
                status,
                run.skip_reason.clone(),
            ));
        }

        let graph = scheduler.graph().clone();
        for index in scheduler.take_eligible() {
            let node = graph.node(index);
            let task = self.build_task(pipeline_id, context, node, scheduler);
            info!(job = %node.name, stage = %node.stage, "job started");
            self.progress.send_event(ExecutionEvent::job_status_changed(
                &node.stage,
                &node.name,
                JobStatus::Running,
                None,
            ));

            let pool = pool.clone();
            tasks.spawn(async move {
                let mut inner = AbortOnDrop(tokio::spawn(async move { pool.execute(task).await }));
                match (&mut inner.0).await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome {
                        index,
                        result: RunResult::failed(
                            FailureCause::Infrastructure {
                                message: format!("job task failed: {}", e),
                            },
                            1,
                        ),
                        trace: String::new(),
                    },
                }
            });
        }
    }

    fn build_task(
        &self,
        pipeline_id: &str,
        context: &RuleContext,
        node: &JobNode,
        scheduler: &Scheduler,
    ) -> JobTask {
        let pipeline = &self.pipeline;
        let spec = &node.spec;

        let mut job_variables = spec.variables.clone();
        job_variables.extend(node.rule_variables.clone());
        let variables = context.variables_for(&pipeline.variables, &job_variables);

        let image = pipeline
            .image_for(spec)
            .map(|image| expand_variables(&image, &variables))
            .unwrap_or_else(|| self.config.default_image.clone());

        let timeout = pipeline
            .timeout_for(spec)
            .and_then(|t| parse_duration(t).ok())
            .unwrap_or(self.config.default_timeout);

        let cache = pipeline.cache_for(spec).map(|cache| {
            let mut cache = cache.clone();
            cache.key = Some(expand_variables(cache.key_or_default(), &variables));
            cache
        });

        let artifact_sources = node
            .artifact_sources
            .iter()
            .map(|&source| {
                let upstream = scheduler.graph().node(source);
                let run = scheduler.run(source);
                let key = artifact_key(pipeline_id, &upstream.name, &ArtifactKind::Generic);
                let produced = run.artifacts.contains(&key);
                ArtifactSource {
                    job: upstream.name.clone(),
                    key: produced.then_some(key),
                    required: node.explicit_artifacts
                        && run.status == JobStatus::Success
                        && upstream
                            .spec
                            .artifacts
                            .as_ref()
                            .is_some_and(|a| !a.paths.is_empty()),
                }
            })
            .collect();

        JobTask {
            pipeline_id: pipeline_id.to_string(),
            index: node.index,
            name: node.name.clone(),
            stage: node.stage.clone(),
            image,
            before_script: pipeline.before_script_for(spec).to_vec(),
            script: spec.script.clone(),
            after_script: pipeline.after_script_for(spec).to_vec(),
            variables,
            timeout,
            retries: pipeline.retries_for(spec),
            artifacts: spec.artifacts.clone(),
            cache,
            artifact_sources,
        }
    }

    fn record_outcome(&self, scheduler: &mut Scheduler, outcome: JobOutcome) {
        let index = outcome.index;
        let status = scheduler.complete(index, outcome.result);
        let run = scheduler.run(index);

        match (&run.failure, run.allow_failure) {
            (Some(cause), true) => warn!(job = %run.job, %cause, "job failed (allowed)"),
            (Some(cause), false) => warn!(job = %run.job, %cause, "job failed"),
            (None, _) => info!(job = %run.job, attempts = run.attempts, "job succeeded"),
        }

        self.progress.send_event(ExecutionEvent::job_completed(
            &run.stage,
            &run.job,
            status,
            run.duration().unwrap_or_default(),
            run.failure.clone(),
        ));
    }

    async fn cancel(&self, scheduler: &mut Scheduler, tasks: &mut JoinSet<JobOutcome>) {
        info!("pipeline canceled");
        let running = scheduler.cancel();
        tasks.shutdown().await;
        for index in running {
            scheduler.mark_canceled(index);
        }

        for run in scheduler.runs() {
            if run.status == JobStatus::Canceled {
                self.progress.send_event(ExecutionEvent::job_status_changed(
                    &run.stage,
                    &run.job,
                    JobStatus::Canceled,
                    None,
                ));
            }
        }
    }

    /// Deliver the summary to every notifier; failures are logged and returned
    async fn notify(&self, summary: &PipelineSummary) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.send(summary).await {
                warn!(notifier = notifier.name(), error = %e, "notification failed");
                failures.push((notifier.name().to_string(), e.to_string()));
            }
        }
        failures
    }
}

async fn recv_signal(
    control: &mut Option<mpsc::UnboundedReceiver<ControlSignal>>,
) -> Option<ControlSignal> {
    match control {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
