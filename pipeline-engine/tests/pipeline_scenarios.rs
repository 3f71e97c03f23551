// Pipeline Scenarios
// End-to-end controller runs against a scripted in-memory container runtime

use pipeline_engine::execution::{progress_channel, ExecutionEvent, ProgressReceiver};
use pipeline_engine::runners::{ContainerRuntime, RunOutput, RunRequest, RuntimeError};
use pipeline_engine::store::Bundle;
use pipeline_engine::{
    ArtifactStore, EngineConfig, JobStatus, Notifier, PipelineController, PipelineParser,
    PipelineStatus, PipelineSummary, Trigger,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Runtime interpreting a tiny script language:
/// `fail <code>` exits non-zero, `write <path> <text>` creates a workspace
/// file, anything else is echoed.
#[derive(Default)]
struct ScriptedRuntime {
    started: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
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
        self.started.lock().unwrap().push(request.job.clone());

        let mut stdout = Vec::new();
        for line in &request.script {
            let mut words = line.splitn(3, ' ');
            match (words.next(), words.next(), words.next()) {
                (Some("fail"), code, _) => {
                    let code = code.and_then(|c| c.parse().ok()).unwrap_or(1);
                    return Ok(RunOutput::failure(code, format!("{} failed", request.job)));
                }
                (Some("write"), Some(path), text) => {
                    let root = request.host_workdir().expect("workspace mount");
                    let target = root.join(path);
                    std::fs::create_dir_all(target.parent().unwrap())?;
                    std::fs::write(target, text.unwrap_or_default())?;
                }
                (Some("sleep"), Some(ms), _) => {
                    let ms = ms.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                _ => stdout.push(line.clone()),
            }
        }
        Ok(RunOutput::success(stdout.join("\n")))
    }
}

struct Harness {
    runtime: Arc<ScriptedRuntime>,
    store: ArtifactStore,
    workspace: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            runtime: Arc::new(ScriptedRuntime::default()),
            store: ArtifactStore::in_memory(),
            workspace: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_workspace_dir(self.workspace.path())
            .with_infra_retries(0, Duration::from_millis(1))
    }

    fn controller(&self, yaml: &str, config: EngineConfig) -> PipelineController {
        let pipeline = PipelineParser::parse(yaml).unwrap();
        PipelineController::new(pipeline, self.runtime.clone(), config)
            .with_store(self.store.clone())
    }
}

/// Wait until `job` reports `status` on the progress channel
async fn wait_for_status(events: &mut ProgressReceiver, job: &str, status: JobStatus) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let ExecutionEvent::JobStatusChanged {
                job_name,
                status: s,
                ..
            } = event
            {
                if job_name == job && s == status {
                    return;
                }
            }
        }
        panic!("progress channel closed before {} became {}", job, status);
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for job status");
}

const THREE_STAGES: &str = r#"
stages: [build, test, deploy]

build:
  stage: build
  script: make

t1:
  stage: test
  script: fail 2
  allow_failure: true

t2:
  stage: test
  script: make test

deploy:
  stage: deploy
  script: make deploy
"#;

#[tokio::test]
async fn test_allowed_failure_closes_stage() {
    let h = Harness::new();
    let report = h
        .controller(THREE_STAGES, h.config())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status_of("t1"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("t2"), Some(JobStatus::Success));
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Success));
    assert_eq!(report.status, PipelineStatus::Success);

    let started = h.runtime.started();
    let deploy = started.iter().position(|j| j == "deploy").unwrap();
    let t1 = started.iter().position(|j| j == "t1").unwrap();
    let t2 = started.iter().position(|j| j == "t2").unwrap();
    assert!(deploy > t1 && deploy > t2);
}

#[tokio::test]
async fn test_build_failure_skips_next_stage() {
    let h = Harness::new();
    let report = h
        .controller(
            r#"
stages: [build, test]

build:
  stage: build
  script: fail 1

unit:
  stage: test
  script: make unit

lint:
  stage: test
  script: make lint
"#,
            h.config(),
        )
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(report.status_of("build"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("unit"), Some(JobStatus::Skipped));
    assert_eq!(report.status_of("lint"), Some(JobStatus::Skipped));
    assert_eq!(h.runtime.started(), vec!["build".to_string()]);
}

#[tokio::test]
async fn test_failed_need_skips_dependent() {
    let h = Harness::new();
    let report = h
        .controller(
            r#"
stages: [build, test]

a:
  stage: build
  script: fail 1

other:
  stage: build
  script: make

b:
  stage: test
  needs: [a]
  script: make b
"#,
            h.config(),
        )
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status_of("b"), Some(JobStatus::Skipped));
    assert!(report.run("b").unwrap().started_at.is_none());
    assert!(!h.runtime.started().contains(&"b".to_string()));
}

const MANUAL_DEPLOY: &str = r#"
stages: [build, deploy]

build:
  stage: build
  script: make

deploy:
  stage: deploy
  script: make deploy
  when: manual
"#;

#[tokio::test]
async fn test_manual_job_never_auto_runs() {
    let h = Harness::new();
    let report = h
        .controller(MANUAL_DEPLOY, h.config())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status_of("build"), Some(JobStatus::Success));
    assert_eq!(report.status_of("deploy"), Some(JobStatus::ManualWait));
    assert!(!h.runtime.started().contains(&"deploy".to_string()));
    // Manual jobs are allowed to fail unless a rule says otherwise
    assert_eq!(report.status, PipelineStatus::Success);
}

#[tokio::test]
async fn test_manual_job_runs_when_played() {
    let h = Harness::new();
    let (tx, mut events) = progress_channel();
    let mut controller = h
        .controller(MANUAL_DEPLOY, h.config().with_wait_for_manual(true))
        .with_progress(tx);
    let handle = controller.handle();

    let run = tokio::spawn(controller.run(Trigger::for_branch("main")));

    wait_for_status(&mut events, "deploy", JobStatus::ManualWait).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());
    assert!(!h.runtime.started().contains(&"deploy".to_string()));

    handle.play("deploy").unwrap();
    drop(handle);

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Success));
    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(h.runtime.started(), vec!["build".to_string(), "deploy".to_string()]);
}

#[tokio::test]
async fn test_pre_approved_manual_job_runs() {
    let h = Harness::new();
    let report = h
        .controller(MANUAL_DEPLOY, h.config())
        .run(Trigger::for_branch("main").with_play("deploy"))
        .await
        .unwrap();

    assert_eq!(report.status_of("deploy"), Some(JobStatus::Success));
}

const FAILED_BUILD_MANUAL_DEPLOY: &str = r#"
stages: [build, deploy]

build:
  stage: build
  script: fail 1

deploy:
  stage: deploy
  script: make deploy
  when: manual
"#;

#[tokio::test]
async fn test_manual_job_after_failed_build_is_not_skipped() {
    let h = Harness::new();
    let report = h
        .controller(FAILED_BUILD_MANUAL_DEPLOY, h.config())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Pending));
    assert!(!h.runtime.started().contains(&"deploy".to_string()));

    let h = Harness::new();
    let report = h
        .controller(FAILED_BUILD_MANUAL_DEPLOY, h.config())
        .run(Trigger::for_branch("main").with_play("deploy"))
        .await
        .unwrap();

    assert_eq!(report.status_of("deploy"), Some(JobStatus::Success));
    assert_eq!(report.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn test_cancel_moves_manual_wait_to_canceled() {
    let h = Harness::new();
    let (tx, mut events) = progress_channel();
    let mut controller = h
        .controller(MANUAL_DEPLOY, h.config().with_wait_for_manual(true))
        .with_progress(tx);
    let handle = controller.handle();

    let run = tokio::spawn(controller.run(Trigger::for_branch("main")));

    wait_for_status(&mut events, "deploy", JobStatus::ManualWait).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    handle.cancel().unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PipelineStatus::Canceled);
    assert_eq!(report.status_of("build"), Some(JobStatus::Success));
    assert_eq!(report.status_of("deploy"), Some(JobStatus::Canceled));
}

#[tokio::test]
async fn test_cancel_aborts_running_jobs() {
    let h = Harness::new();
    let (tx, mut events) = progress_channel();
    let mut controller = h
        .controller(
            r#"
stages: [build, test]

slow:
  stage: build
  script: sleep 10000

after:
  stage: test
  script: make
"#,
            h.config(),
        )
        .with_progress(tx);
    let handle = controller.handle();

    let run = tokio::spawn(controller.run(Trigger::for_branch("main")));

    wait_for_status(&mut events, "slow", JobStatus::Running).await;
    handle.cancel().unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancel did not stop the pipeline")
        .unwrap()
        .unwrap();
    assert_eq!(report.status, PipelineStatus::Canceled);
    assert_eq!(report.status_of("slow"), Some(JobStatus::Canceled));
    assert_eq!(report.status_of("after"), Some(JobStatus::Canceled));
}

#[tokio::test]
async fn test_artifacts_flow_between_jobs() {
    let h = Harness::new();
    let report = h
        .controller(
            r#"
stages: [build, test]

build:
  stage: build
  script: write dist/app.bin binary
  artifacts:
    paths: [dist/]
    expire_in: 1 week

test:
  stage: test
  needs: [build]
  script: make test
"#,
            h.config(),
        )
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Success);

    let key = format!("{}/build/artifacts", report.pipeline_id);
    assert!(report.artifacts().any(|k| k == key));

    let artifact = h.store.get(&key).await.unwrap();
    assert!(artifact.meta.expires_at.is_some());
    let bundle = artifact.bundle().unwrap();
    assert_eq!(bundle.get("dist/app.bin"), Some(&b"binary"[..]));
}

#[tokio::test]
async fn test_cache_merges_across_pipelines() {
    let yaml = |file: &str| {
        format!(
            r#"
build:
  stage: build
  script: write cache/{} data
  cache:
    key: deps-$CI_COMMIT_REF_SLUG
    paths: [cache/]
"#,
            file
        )
    };

    let h = Harness::new();
    h.controller(&yaml("a.txt"), h.config())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    std::fs::remove_dir_all(h.workspace.path().join("cache")).unwrap();

    h.controller(&yaml("b.txt"), h.config())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    let cache: Bundle = h.store.get_cache("deps-main").await.unwrap().unwrap();
    let mut paths: Vec<&str> = cache.paths().collect();
    paths.sort();
    assert_eq!(paths, vec!["cache/a.txt", "cache/b.txt"]);
    assert!(Path::new(&h.workspace.path().join("cache/a.txt")).exists());
}

#[tokio::test]
async fn test_rules_pick_jobs_for_trigger() {
    let yaml = r#"
build:
  stage: build
  script: make

release:
  stage: deploy
  script: make release
  rules:
    - if: $CI_COMMIT_TAG
    - when: never

docs:
  stage: test
  script: make docs
  only:
    changes: ["docs/**/*"]
"#;

    let h = Harness::new();
    let branch = h
        .controller(yaml, h.config())
        .run(Trigger::for_branch("main").with_changed_paths(vec!["src/lib.rs".to_string()]))
        .await
        .unwrap();
    assert!(branch.run("release").is_none());
    assert!(branch.run("docs").is_none());

    let tag = h
        .controller(yaml, h.config())
        .run(Trigger::for_tag("v1.0.0").with_changed_paths(vec!["docs/index.md".to_string()]))
        .await
        .unwrap();
    assert_eq!(tag.status_of("release"), Some(JobStatus::Success));
    assert_eq!(tag.status_of("docs"), Some(JobStatus::Success));
}

struct RecordingNotifier {
    fail: bool,
    seen: Mutex<Vec<PipelineStatus>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        if self.fail {
            "broken"
        } else {
            "recording"
        }
    }

    async fn send(
        &self,
        summary: &PipelineSummary,
    ) -> Result<(), pipeline_engine::notify::NotificationError> {
        self.seen.lock().unwrap().push(summary.status);
        if self.fail {
            return Err(pipeline_engine::notify::NotificationError::Unavailable(
                "channel down".to_string(),
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_notification_failure_keeps_status() {
    let h = Harness::new();
    let broken = Arc::new(RecordingNotifier {
        fail: true,
        seen: Mutex::new(Vec::new()),
    });
    let recording = Arc::new(RecordingNotifier {
        fail: false,
        seen: Mutex::new(Vec::new()),
    });

    let report = h
        .controller(THREE_STAGES, h.config())
        .with_notifier(broken.clone())
        .with_notifier(recording.clone())
        .run(Trigger::for_branch("main"))
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(report.notification_errors.len(), 1);
    assert_eq!(report.notification_errors[0].0, "broken");
    assert_eq!(*recording.seen.lock().unwrap(), vec![PipelineStatus::Success]);
}

#[tokio::test]
async fn test_job_variables_reach_runtime() {
    struct EnvRuntime(Mutex<HashMap<String, String>>);

    #[async_trait::async_trait]
    impl ContainerRuntime for EnvRuntime {
        fn name(&self) -> &str {
            "env"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError> {
            *self.0.lock().unwrap() = request.env.clone();
            Ok(RunOutput::success(""))
        }
    }

    let runtime = Arc::new(EnvRuntime(Mutex::new(HashMap::new())));
    let pipeline = PipelineParser::parse(
        r#"
variables:
  GLOBAL: one

build:
  stage: build
  variables:
    LOCAL: two
  script: make
"#,
    )
    .unwrap();

    let workspace = TempDir::new().unwrap();
    PipelineController::new(
        pipeline,
        runtime.clone(),
        EngineConfig::default().with_workspace_dir(workspace.path()),
    )
    .run(Trigger::for_branch("feature/x").with_variable("EXTRA", "three"))
    .await
    .unwrap();

    let env = runtime.0.lock().unwrap().clone();
    assert_eq!(env["GLOBAL"], "one");
    assert_eq!(env["LOCAL"], "two");
    assert_eq!(env["EXTRA"], "three");
    assert_eq!(env["CI_COMMIT_REF_NAME"], "feature/x");
    assert_eq!(env["CI_JOB_NAME"], "build");
}
