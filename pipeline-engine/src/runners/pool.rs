// Executor Pool
// Bounded concurrent execution of job runs: restore, run with retries, publish outputs

use crate::config::EngineConfig;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::scheduler::{FailureCause, RunResult};
use crate::parser::models::{ArtifactSpec, CacheSpec};
use crate::runners::{ContainerRuntime, Mount, RunOutput, RunRequest};
use crate::store::{artifact_key, ArtifactKind, ArtifactStore, Bundle, Producer, StoreError};
use crate::utils::parse_expiry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Slack on top of the job timeout before the pool gives up on a runtime
/// that does not enforce the timeout itself
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Report name stored with the `Coverage` kind
const COVERAGE_REPORT: &str = "coverage_report";

/// Artifacts of an upstream job to restore before running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub job: String,
    /// Store key of the upstream's `artifacts.paths` bundle, if it produced one
    pub key: Option<String>,
    /// Fail the job when the artifacts cannot be restored
    pub required: bool,
}

/// Everything the pool needs to execute one job run
#[derive(Debug, Clone)]
pub struct JobTask {
    pub pipeline_id: String,
    /// Index of the job in the graph
    pub index: usize,
    pub name: String,
    pub stage: String,
    pub image: String,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub after_script: Vec<String>,
    pub variables: HashMap<String, String>,
    pub timeout: Duration,
    /// Extra attempts after a script failure or timeout
    pub retries: u32,
    pub artifacts: Option<ArtifactSpec>,
    /// Cache declaration with its key already expanded
    pub cache: Option<CacheSpec>,
    pub artifact_sources: Vec<ArtifactSource>,
}

impl JobTask {
    /// Task with only a script; everything else empty or defaulted
    pub fn new(
        pipeline_id: impl Into<String>,
        index: usize,
        name: impl Into<String>,
        stage: impl Into<String>,
        script: Vec<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            index,
            name: name.into(),
            stage: stage.into(),
            image: String::new(),
            before_script: Vec::new(),
            script,
            after_script: Vec::new(),
            variables: HashMap::new(),
            timeout: Duration::from_secs(3600),
            retries: 0,
            artifacts: None,
            cache: None,
            artifact_sources: Vec::new(),
        }
    }

    fn producer(&self) -> Producer {
        Producer::new(&self.pipeline_id, &self.name)
    }

    /// before_script followed by script
    fn main_script(&self) -> Vec<String> {
        self.before_script
            .iter()
            .chain(self.script.iter())
            .cloned()
            .collect()
    }
}

/// Result of executing a job task
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub index: usize,
    pub result: RunResult,
    /// Combined output of every attempt
    pub trace: String,
}

/// Runs job tasks through a container runtime, at most
/// `max_parallel_jobs` at a time
#[derive(Clone)]
pub struct ExecutorPool {
    runtime: Arc<dyn ContainerRuntime>,
    store: ArtifactStore,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
    progress: Option<ProgressSender>,
}

impl ExecutorPool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: ArtifactStore, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_jobs.max(1)));
        Self {
            runtime,
            store,
            config: Arc::new(config),
            permits,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Slots not currently in use
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Execute a job task to completion, waiting for a free slot first
    pub async fn execute(&self, task: JobTask) -> JobOutcome {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return JobOutcome {
                    index: task.index,
                    result: RunResult::failed(
                        FailureCause::Infrastructure {
                            message: format!("executor pool closed: {}", e),
                        },
                        0,
                    ),
                    trace: String::new(),
                };
            }
        };

        let mut trace = String::new();

        if let Err(cause) = self.restore_artifacts(&task).await {
            warn!(job = %task.name, "{}", cause);
            return JobOutcome {
                index: task.index,
                result: RunResult::failed(cause, 0),
                trace,
            };
        }
        self.restore_cache(&task).await;

        let (failure, attempts) = self.run_with_retries(&task, &mut trace).await;
        let ran_script = !matches!(failure, Some(FailureCause::Infrastructure { .. }));

        if ran_script && !task.after_script.is_empty() {
            self.run_after_script(&task, &mut trace).await;
        }

        let mut artifacts = Vec::new();
        let succeeded = failure.is_none();

        if let Some(key) = self
            .put_artifact(&task, ArtifactKind::Trace, trace.clone().into_bytes(), None)
            .await
        {
            artifacts.push(key);
        }
        artifacts.extend(self.publish_artifacts(&task, succeeded).await);
        if succeeded {
            self.push_cache(&task).await;
        }

        let result = match failure {
            None => RunResult::success(attempts),
            Some(cause) => RunResult::failed(cause, attempts),
        };

        JobOutcome {
            index: task.index,
            result: result.with_artifacts(artifacts),
            trace,
        }
    }

    fn request(&self, task: &JobTask, script: Vec<String>, timeout: Duration) -> RunRequest {
        let image = if task.image.is_empty() {
            self.config.default_image.clone()
        } else {
            task.image.clone()
        };

        let mut env = task.variables.clone();
        env.insert("CI_JOB_NAME".to_string(), task.name.clone());
        env.insert("CI_JOB_STAGE".to_string(), task.stage.clone());
        env.insert("CI_PIPELINE_ID".to_string(), task.pipeline_id.clone());

        RunRequest {
            job: task.name.clone(),
            image,
            script,
            mounts: vec![Mount::new(
                &self.config.workspace_dir,
                &self.config.container_workdir,
            )],
            env,
            timeout,
            workdir: self.config.container_workdir.clone(),
        }
    }

    /// Run the main script, retrying infrastructure errors and (per `retry:`)
    /// script failures and timeouts. Returns the final failure, if any, and
    /// the number of attempts made.
    async fn run_with_retries(
        &self,
        task: &JobTask,
        trace: &mut String,
    ) -> (Option<FailureCause>, u32) {
        let request = self.request(task, task.main_script(), task.timeout);
        let mut attempts = 0;
        let mut infra_errors = 0;
        let mut script_retries = 0;

        loop {
            attempts += 1;
            self.progress
                .send_event(ExecutionEvent::job_started(&task.stage, &task.name, attempts));
            debug!(job = %task.name, attempt = attempts, runtime = self.runtime.name(), "running job");

            let output = match tokio::time::timeout(
                task.timeout + TIMEOUT_GRACE,
                self.runtime.run(&request),
            )
            .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    if infra_errors < self.config.infra_retries {
                        infra_errors += 1;
                        warn!(
                            job = %task.name,
                            attempt = attempts,
                            error = %e,
                            "runtime error, retrying in {:?}",
                            self.config.infra_retry_backoff
                        );
                        tokio::time::sleep(self.config.infra_retry_backoff).await;
                        continue;
                    }
                    append_trace(trace, &format!("ERROR: {}", e));
                    return (
                        Some(FailureCause::Infrastructure {
                            message: e.to_string(),
                        }),
                        attempts,
                    );
                }
                Err(_) => RunOutput {
                    stderr: format!("Job exceeded its timeout of {:?}", task.timeout),
                    ..RunOutput::timeout()
                },
            };

            self.forward_output(task, &output);
            append_trace(trace, &output.trace());

            if output.succeeded() {
                return (None, attempts);
            }

            let cause = if output.timed_out {
                FailureCause::Timeout
            } else {
                FailureCause::Script {
                    exit_code: output.exit_code,
                }
            };

            if script_retries < task.retries {
                script_retries += 1;
                info!(job = %task.name, %cause, "retrying job ({}/{})", script_retries, task.retries);
                continue;
            }
            return (Some(cause), attempts);
        }
    }

    /// `after_script` runs regardless of the main script's result; its
    /// outcome never changes the job status
    async fn run_after_script(&self, task: &JobTask, trace: &mut String) {
        let request = self.request(
            task,
            task.after_script.clone(),
            self.config.after_script_timeout,
        );
        match self.runtime.run(&request).await {
            Ok(output) => {
                self.forward_output(task, &output);
                append_trace(trace, &output.trace());
                if !output.succeeded() {
                    warn!(job = %task.name, exit_code = ?output.exit_code, "after_script failed");
                }
            }
            Err(e) => warn!(job = %task.name, error = %e, "after_script could not run"),
        }
    }

    fn forward_output(&self, task: &JobTask, output: &RunOutput) {
        for line in output.stdout.lines() {
            self.progress
                .send_event(ExecutionEvent::job_output(&task.name, line, false));
        }
        for line in output.stderr.lines() {
            self.progress
                .send_event(ExecutionEvent::job_output(&task.name, line, true));
        }
    }

    async fn restore_artifacts(&self, task: &JobTask) -> Result<(), FailureCause> {
        for source in &task.artifact_sources {
            let restored = match &source.key {
                Some(key) => self.restore_artifact(key).await,
                None => Err(StoreError::NotFound(format!(
                    "{} produced no artifacts",
                    source.job
                ))),
            };

            match restored {
                Ok(files) => {
                    debug!(job = %task.name, from = %source.job, files, "restored artifacts")
                }
                Err(e) if source.required => {
                    return Err(FailureCause::ArtifactRestore {
                        message: format!("artifacts of '{}': {}", source.job, e),
                    });
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(job = %task.name, from = %source.job, error = %e, "skipping artifacts")
                }
            }
        }
        Ok(())
    }

    async fn restore_artifact(&self, key: &str) -> Result<usize, StoreError> {
        let artifact = self.store.get(key).await?;
        artifact.bundle()?.extract(&self.config.workspace_dir)
    }

    async fn restore_cache(&self, task: &JobTask) {
        let Some(cache) = task.cache.as_ref().filter(|c| c.policy.pulls()) else {
            return;
        };
        let key = cache.key_or_default();
        match self.store.get_cache(key).await {
            Ok(Some(bundle)) => match bundle.extract(&self.config.workspace_dir) {
                Ok(files) => debug!(job = %task.name, key, files, "restored cache"),
                Err(e) => warn!(job = %task.name, key, error = %e, "failed to restore cache"),
            },
            Ok(None) => debug!(job = %task.name, key, "no cache yet"),
            Err(e) => warn!(job = %task.name, key, error = %e, "failed to read cache"),
        }
    }

    async fn push_cache(&self, task: &JobTask) {
        let Some(cache) = task.cache.as_ref().filter(|c| c.policy.pushes()) else {
            return;
        };
        let key = cache.key_or_default();
        let bundle = match Bundle::collect(&self.config.workspace_dir, &cache.paths) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(job = %task.name, key, error = %e, "failed to collect cache");
                return;
            }
        };
        match self.store.merge_cache(key, bundle, cache.reset).await {
            Ok(entry) => debug!(job = %task.name, key, files = entry.files, "pushed cache"),
            Err(e) => warn!(job = %task.name, key, error = %e, "failed to push cache"),
        }
    }

    /// Store declared artifacts and reports; returns the keys written
    async fn publish_artifacts(&self, task: &JobTask, succeeded: bool) -> Vec<String> {
        let mut keys = Vec::new();
        let Some(spec) = task.artifacts.as_ref().filter(|a| a.when.applies(succeeded)) else {
            return keys;
        };

        let expiry = match spec.expire_in.as_deref().map(parse_expiry) {
            Some(Ok(expiry)) => expiry,
            Some(Err(e)) => {
                warn!(job = %task.name, error = %e, "ignoring invalid expire_in");
                self.config.default_artifact_expiry
            }
            None => self.config.default_artifact_expiry,
        };

        let mut outputs: Vec<(ArtifactKind, Vec<String>)> = Vec::new();
        if !spec.paths.is_empty() {
            outputs.push((ArtifactKind::Generic, spec.paths.clone()));
        }
        for (report, paths) in &spec.reports {
            let kind = if report == COVERAGE_REPORT {
                ArtifactKind::Coverage
            } else {
                ArtifactKind::Report(report.clone())
            };
            outputs.push((kind, paths.to_vec()));
        }

        for (kind, patterns) in outputs {
            let bundle = match Bundle::collect(&self.config.workspace_dir, &patterns) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(job = %task.name, %kind, error = %e, "failed to collect artifacts");
                    continue;
                }
            };
            if bundle.is_empty() {
                warn!(job = %task.name, %kind, "no files matched {:?}", patterns);
            }
            let blob = match bundle.to_tar() {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(job = %task.name, %kind, error = %e, "failed to bundle artifacts");
                    continue;
                }
            };
            if let Some(key) = self.put_artifact(task, kind, blob, expiry).await {
                keys.push(key);
            }
        }
        keys
    }

    async fn put_artifact(
        &self,
        task: &JobTask,
        kind: ArtifactKind,
        blob: Vec<u8>,
        expiry: Option<Duration>,
    ) -> Option<String> {
        let key = artifact_key(&task.pipeline_id, &task.name, &kind);
        let size = blob.len();
        match self
            .store
            .put(&key, blob, kind, task.producer(), expiry)
            .await
        {
            Ok(_) => {
                self.progress
                    .send_event(ExecutionEvent::artifact_stored(&task.name, &key, size));
                Some(key)
            }
            Err(e) => {
                warn!(job = %task.name, key = %key, error = %e, "failed to store artifact");
                None
            }
        }
    }
}

fn append_trace(trace: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !trace.is_empty() {
        trace.push('\n');
    }
    trace.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{ArtifactWhen, CachePolicy, StringList};
    use crate::runners::RuntimeError;

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Runtime replaying canned results and recording requests
    struct ScriptedRuntime {
        results: Mutex<Vec<Result<RunOutput, RuntimeError>>>,
        requests: Mutex<Vec<RunRequest>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedRuntime {
        fn new(results: Vec<Result<RunOutput, RuntimeError>>) -> Self {
            Self {
                results: Mutex::new(results),
                requests: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn requests(&self) -> Vec<RunRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(RunOutput::success(""))
            } else {
                results.remove(0)
            }
        }
    }

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::default()
            .with_workspace_dir(dir)
            .with_infra_retries(2, Duration::from_millis(1))
    }

    fn task(name: &str) -> JobTask {
        JobTask::new("p1", 0, name, "build", vec!["make".to_string()])
    }

    #[tokio::test]
    async fn test_success_stores_trace() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![Ok(RunOutput::success("built"))]));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let outcome = pool.execute(task("compile")).await;

        assert!(outcome.result.failure.is_none());
        assert_eq!(outcome.result.attempts, 1);
        assert_eq!(outcome.trace, "built");
        assert_eq!(outcome.result.artifacts, vec!["p1/compile/trace".to_string()]);

        let trace = pool.store().get("p1/compile/trace").await.unwrap();
        assert_eq!(trace.meta.kind, ArtifactKind::Trace);
        assert_eq!(trace.blob, b"built");

        let request = &runtime.requests()[0];
        assert_eq!(request.image, "alpine:latest");
        assert_eq!(request.env["CI_JOB_NAME"], "compile");
        assert_eq!(request.env["CI_PIPELINE_ID"], "p1");
    }

    #[tokio::test]
    async fn test_before_script_runs_first() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let mut t = task("compile");
        t.before_script = vec!["setup".to_string()];
        pool.execute(t).await;

        assert_eq!(runtime.requests()[0].script, vec!["setup", "make"]);
    }

    #[tokio::test]
    async fn test_script_failure_is_not_retried_by_default() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![Ok(RunOutput::failure(2, "boom"))]));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let outcome = pool.execute(task("compile")).await;

        assert_eq!(
            outcome.result.failure,
            Some(FailureCause::Script { exit_code: Some(2) })
        );
        assert_eq!(outcome.result.attempts, 1);
        assert_eq!(runtime.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_reruns_script_failures() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Ok(RunOutput::failure(1, "flaky")),
            Ok(RunOutput::timeout()),
            Ok(RunOutput::success("ok")),
        ]));
        let pool = ExecutorPool::new(runtime, ArtifactStore::in_memory(), config(temp.path()));

        let mut t = task("compile");
        t.retries = 2;
        let outcome = pool.execute(t).await;

        assert!(outcome.result.failure.is_none());
        assert_eq!(outcome.result.attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_cause() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![Ok(RunOutput::timeout())]));
        let pool = ExecutorPool::new(runtime, ArtifactStore::in_memory(), config(temp.path()));

        let outcome = pool.execute(task("compile")).await;
        assert_eq!(outcome.result.failure, Some(FailureCause::Timeout));
    }

    #[tokio::test]
    async fn test_infrastructure_errors_retried_then_failed() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Err(RuntimeError::Unavailable("daemon down".to_string())),
            Err(RuntimeError::Unavailable("daemon down".to_string())),
            Err(RuntimeError::Unavailable("daemon down".to_string())),
        ]));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let mut t = task("compile");
        t.after_script = vec!["cleanup".to_string()];
        let outcome = pool.execute(t).await;

        assert!(matches!(
            outcome.result.failure,
            Some(FailureCause::Infrastructure { .. })
        ));
        assert_eq!(outcome.result.attempts, 3);
        // after_script is not attempted when the environment never came up
        assert_eq!(runtime.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_infrastructure_error_recovers() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Err(RuntimeError::PullFailed("registry timeout".to_string())),
            Ok(RunOutput::success("ok")),
        ]));
        let pool = ExecutorPool::new(runtime, ArtifactStore::in_memory(), config(temp.path()));

        let outcome = pool.execute(task("compile")).await;
        assert!(outcome.result.failure.is_none());
        assert_eq!(outcome.result.attempts, 2);
    }

    #[tokio::test]
    async fn test_after_script_does_not_change_status() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Ok(RunOutput::success("main")),
            Ok(RunOutput::failure(1, "cleanup failed")),
        ]));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let mut t = task("compile");
        t.after_script = vec!["cleanup".to_string()];
        let outcome = pool.execute(t).await;

        assert!(outcome.result.failure.is_none());
        assert_eq!(runtime.requests()[1].script, vec!["cleanup"]);
        assert!(outcome.trace.contains("cleanup failed"));
    }

    #[tokio::test]
    async fn test_artifacts_published_and_restored() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("dist")).unwrap();
        std::fs::write(temp.path().join("dist/app"), "binary").unwrap();
        std::fs::write(temp.path().join("junit.xml"), "<testsuite/>").unwrap();

        let store = ArtifactStore::in_memory();
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));
        let pool = ExecutorPool::new(runtime, store.clone(), config(temp.path()));

        let mut producer = task("compile");
        producer.artifacts = Some(ArtifactSpec {
            paths: vec!["dist/".to_string()],
            expire_in: Some("1 week".to_string()),
            reports: BTreeMap::from([(
                "junit".to_string(),
                StringList::One("junit.xml".to_string()),
            )]),
            ..Default::default()
        });
        let outcome = pool.execute(producer).await;
        assert_eq!(
            outcome.result.artifacts,
            vec![
                "p1/compile/trace".to_string(),
                "p1/compile/artifacts".to_string(),
                "p1/compile/report-junit".to_string(),
            ]
        );
        assert!(store.meta("p1/compile/artifacts").await.unwrap().expires_at.is_some());

        // Consumer restores into a clean workspace
        std::fs::remove_dir_all(temp.path().join("dist")).unwrap();
        let mut consumer = task("package");
        consumer.artifact_sources = vec![ArtifactSource {
            job: "compile".to_string(),
            key: Some("p1/compile/artifacts".to_string()),
            required: true,
        }];
        let outcome = pool.execute(consumer).await;

        assert!(outcome.result.failure.is_none());
        assert_eq!(
            std::fs::read_to_string(temp.path().join("dist/app")).unwrap(),
            "binary"
        );
    }

    #[tokio::test]
    async fn test_artifacts_on_failure_only() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("crash.log"), "core").unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Ok(RunOutput::success("")),
            Ok(RunOutput::failure(1, "")),
        ]));
        let pool = ExecutorPool::new(runtime, ArtifactStore::in_memory(), config(temp.path()));

        let spec = ArtifactSpec {
            paths: vec!["crash.log".to_string()],
            when: ArtifactWhen::OnFailure,
            ..Default::default()
        };

        let mut ok = task("ok");
        ok.artifacts = Some(spec.clone());
        let outcome = pool.execute(ok).await;
        assert_eq!(outcome.result.artifacts, vec!["p1/ok/trace".to_string()]);

        let mut failing = task("failing");
        failing.artifacts = Some(spec);
        let outcome = pool.execute(failing).await;
        assert!(outcome
            .result
            .artifacts
            .contains(&"p1/failing/artifacts".to_string()));
    }

    #[tokio::test]
    async fn test_coverage_report_kind() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("cobertura.xml"), "<coverage/>").unwrap();
        let store = ArtifactStore::in_memory();
        let pool = ExecutorPool::new(
            Arc::new(ScriptedRuntime::new(Vec::new())),
            store.clone(),
            config(temp.path()),
        );

        let mut t = task("coverage");
        t.artifacts = Some(ArtifactSpec {
            reports: BTreeMap::from([(
                "coverage_report".to_string(),
                StringList::One("cobertura.xml".to_string()),
            )]),
            ..Default::default()
        });
        pool.execute(t).await;

        let meta = store.meta("p1/coverage/coverage").await.unwrap();
        assert_eq!(meta.kind, ArtifactKind::Coverage);
    }

    #[tokio::test]
    async fn test_missing_required_artifacts_fail_job() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));
        let pool = ExecutorPool::new(runtime.clone(), ArtifactStore::in_memory(), config(temp.path()));

        let mut t = task("deploy");
        t.artifact_sources = vec![ArtifactSource {
            job: "compile".to_string(),
            key: Some("p1/compile/artifacts".to_string()),
            required: true,
        }];
        let outcome = pool.execute(t).await;

        assert!(matches!(
            outcome.result.failure,
            Some(FailureCause::ArtifactRestore { .. })
        ));
        assert_eq!(outcome.result.attempts, 0);
        assert!(runtime.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_optional_artifacts_are_ignored() {
        let temp = tempfile::tempdir().unwrap();
        let pool = ExecutorPool::new(
            Arc::new(ScriptedRuntime::new(Vec::new())),
            ArtifactStore::in_memory(),
            config(temp.path()),
        );

        let mut t = task("deploy");
        t.artifact_sources = vec![ArtifactSource {
            job: "lint".to_string(),
            key: None,
            required: false,
        }];
        let outcome = pool.execute(t).await;
        assert!(outcome.result.failure.is_none());
    }

    #[tokio::test]
    async fn test_cache_pull_and_push() {
        let temp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::in_memory();
        let mut seed = Bundle::new();
        seed.insert("vendor/old.txt", "old");
        store.merge_cache("deps-main", seed, false).await.unwrap();

        let pool = ExecutorPool::new(
            Arc::new(ScriptedRuntime::new(Vec::new())),
            store.clone(),
            config(temp.path()),
        );

        std::fs::create_dir_all(temp.path().join("vendor")).unwrap();
        std::fs::write(temp.path().join("vendor/new.txt"), "new").unwrap();

        let mut t = task("install");
        t.cache = Some(CacheSpec {
            key: Some("deps-main".to_string()),
            paths: vec!["vendor".to_string()],
            policy: CachePolicy::PullPush,
            reset: false,
        });
        pool.execute(t).await;

        // Pulled before the script ran
        assert!(temp.path().join("vendor/old.txt").exists());

        let cached = store.get_cache("deps-main").await.unwrap().unwrap();
        assert_eq!(cached.get("vendor/new.txt"), Some(&b"new"[..]));
        assert_eq!(cached.get("vendor/old.txt"), Some(&b"old"[..]));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let temp = tempfile::tempdir().unwrap();
        let mut runtime = ScriptedRuntime::new(Vec::new());
        runtime.delay = Duration::from_millis(20);
        let runtime = Arc::new(runtime);
        let pool = ExecutorPool::new(
            runtime.clone(),
            ArtifactStore::in_memory(),
            config(temp.path()).with_max_parallel_jobs(2),
        );

        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            let mut t = task(&format!("job-{}", i));
            t.index = i;
            handles.push(tokio::spawn(async move { pool.execute(t).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(runtime.requests().len(), 6);
        assert!(runtime.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available_slots(), 2);
    }
}
