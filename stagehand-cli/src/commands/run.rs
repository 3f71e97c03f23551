use crate::commands::{load_pipeline, parse_event, parse_variables};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use color_eyre::eyre::bail;
use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use pipeline_engine::execution::events::LogLevel;
use pipeline_engine::store::default_store_dir;
use pipeline_engine::utils::resolve_project_dir;
use pipeline_engine::{
    progress_channel, ArtifactStore, ContainerRuntime, DockerRuntime, EngineConfig,
    ExecutionEvent, JobStatus, LogNotifier, PipelineController, PipelineHandle, PipelineReport,
    PipelineStatus, ShellRuntime, Trigger, WebhookNotifier,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    /// Run every job in a docker container
    Docker,
    /// Run scripts directly on the host with `sh`
    Shell,
}

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Branch the pipeline runs for
    #[arg(long, short = 'b', default_value = "main", conflicts_with = "tag")]
    pub branch: String,

    /// Run for a tag instead of a branch
    #[arg(long)]
    pub tag: Option<String>,

    /// Commit SHA exposed as CI_COMMIT_SHA
    #[arg(long)]
    pub commit: Option<String>,

    /// Trigger event (push, merge_request, schedule, web, api, trigger)
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Mark the pipeline as scheduled
    #[arg(long)]
    pub schedule: bool,

    /// Changed path for `changes:` rules (can be repeated; unset means every rule matches)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed: Vec<String>,

    /// Set a variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Approve a manual job up front (can be repeated)
    #[arg(long, value_name = "JOB")]
    pub play: Vec<String>,

    /// Maximum number of jobs running at once
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Where job scripts run
    #[arg(long, value_enum, default_value_t = RuntimeKind::Docker)]
    pub runtime: RuntimeKind,

    /// Image for jobs that do not declare one
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Project directory mounted into jobs (default: repository root)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Artifact and cache store directory
    #[arg(long, env = "STAGEHAND_STORE", value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// POST the final pipeline status to this URL
    #[arg(long, env = "STAGEHAND_WEBHOOK", value_name = "URL")]
    pub webhook: Option<String>,

    /// Keep the pipeline open for manual jobs; read `play <job>` / `cancel` from stdin
    #[arg(long)]
    pub wait: bool,

    /// Show job output
    #[arg(long)]
    pub verbose: bool,
}

impl RunArgs {
    fn trigger(&self) -> Result<Trigger> {
        let mut trigger = match &self.tag {
            Some(tag) => Trigger::for_tag(tag),
            None => Trigger::for_branch(&self.branch),
        }
        .with_event(parse_event(&self.event)?)
        .with_schedule(self.schedule);

        if let Some(sha) = &self.commit {
            trigger = trigger.with_commit(sha);
        }
        if !self.changed.is_empty() {
            trigger = trigger.with_changed_paths(self.changed.clone());
        }
        trigger.variables = parse_variables(&self.variables)?;
        trigger.play = self.play.clone();
        Ok(trigger)
    }

    fn config(&self, workspace: PathBuf) -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_workspace_dir(workspace)
            .with_wait_for_manual(self.wait);
        if let Some(jobs) = self.jobs {
            config = config.with_max_parallel_jobs(jobs);
        }
        if let Some(image) = &self.image {
            config = config.with_default_image(image);
        }
        config
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    let trigger = args.trigger()?;

    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => resolve_project_dir(),
    };

    let runtime: Arc<dyn ContainerRuntime> = match args.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new()),
        RuntimeKind::Shell => Arc::new(ShellRuntime::new().with_fallback_dir(&workspace)),
    };
    if !runtime.is_available().await {
        bail!("The {} runtime is not available on this machine", runtime.name());
    }

    let store_dir = args.store.clone().unwrap_or_else(default_store_dir);

    output::status("Parsing", &format!("{}", args.pipeline.display()));
    output::info(&format!(
        "{} jobs, runtime {}, workspace {}",
        pipeline.jobs.len(),
        runtime.name(),
        workspace.display()
    ));
    output::dim(&format!("  store: {}", store_dir.display()));

    let (tx, mut rx) = progress_channel();
    let mut controller = PipelineController::new(pipeline, runtime, args.config(workspace))
        .with_store(ArtifactStore::on_disk(store_dir))
        .with_notifier(Arc::new(LogNotifier))
        .with_progress(tx);
    if let Some(url) = &args.webhook {
        controller = controller.with_notifier(Arc::new(WebhookNotifier::new(url)));
    }

    let handle = controller.handle();
    spawn_interrupt_handler(handle.clone());
    if args.wait {
        spawn_stdin_commands(handle.clone());
    }
    drop(handle);

    let run = tokio::spawn(controller.run(trigger));

    while let Some(event) = rx.recv().await {
        print_event(&event, &args);
    }

    let report = run.await??;
    print_summary(&report);

    if matches!(report.status, PipelineStatus::Failed | PipelineStatus::Canceled) {
        std::process::exit(1);
    }

    Ok(())
}

/// Ctrl-C cancels the pipeline
fn spawn_interrupt_handler(handle: PipelineHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, canceling pipeline");
            let _ = handle.cancel();
        }
    });
}

/// Accept `play <job>` and `cancel` lines on stdin
fn spawn_stdin_commands(handle: PipelineHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let result = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["play", job] => handle.play(*job),
                ["cancel"] => handle.cancel(),
                [] => continue,
                _ => {
                    output::warning("Commands: play <job>, cancel");
                    continue;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });
}

fn print_event(event: &ExecutionEvent, args: &RunArgs) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_id,
            total_jobs,
            stages,
        } => {
            println!();
            output::header(&format!(
                "Pipeline {} ({} jobs, stages: {})",
                pipeline_id,
                total_jobs,
                stages.join(" -> ")
            ));
        }

        ExecutionEvent::JobStatusChanged {
            stage_name,
            job_name,
            status,
            reason,
        } => match status {
            JobStatus::Running => {
                output::status("Running", &format!("{} ({})", job_name, stage_name))
            }
            JobStatus::ManualWait if args.wait => output::info(&format!(
                "Job '{}' is manual; type `play {}` to start it",
                job_name, job_name
            )),
            JobStatus::ManualWait => output::info(&format!(
                "Job '{}' is manual; rerun with --play {} to start it",
                job_name, job_name
            )),
            JobStatus::Skipped => output::warning(&format!(
                "Job '{}' skipped: {}",
                job_name,
                reason.as_deref().unwrap_or("upstream did not succeed")
            )),
            JobStatus::Canceled => output::warning(&format!("Job '{}' canceled", job_name)),
            _ => {}
        },

        ExecutionEvent::JobStarted {
            job_name, attempt, ..
        } if *attempt > 1 => {
            output::status("Retrying", &format!("{} (attempt {})", job_name, attempt));
        }

        ExecutionEvent::JobOutput {
            job_name,
            output: text,
            is_error,
        } if args.verbose => {
            for line in text.lines() {
                let line = format!("[{}] {}", job_name, line);
                if *is_error {
                    output::step_error(&line);
                } else {
                    output::step_output(&line);
                }
            }
        }

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            duration,
            failure,
            ..
        } => {
            let line = format!(
                "  Job '{}' {} ({:.2}s)",
                job_name,
                status,
                duration.as_secs_f64()
            );
            match (status, failure) {
                (JobStatus::Success, _) => output::dim_success(&line),
                (_, Some(cause)) => output::dim_failure(&format!("{}: {}", line, cause)),
                _ => output::dim_failure(&line),
            }
        }

        ExecutionEvent::ArtifactStored {
            job_name,
            key,
            size,
        } if args.verbose => {
            output::dim(&format!("  [{}] stored {} ({} bytes)", job_name, key, size));
        }

        ExecutionEvent::Log {
            level,
            message,
            job_name,
        } => {
            let message = match job_name {
                Some(job) => format!("[{}] {}", job, message),
                None => message.clone(),
            };
            match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                LogLevel::Info => output::info(&message),
                LogLevel::Debug => output::dim(&message),
            }
        }

        ExecutionEvent::PipelineCompleted {
            status, duration, ..
        } => {
            println!();
            let line = format!("Pipeline {} in {:.2}s", status, duration.as_secs_f64());
            match status {
                PipelineStatus::Success => output::success(&line),
                PipelineStatus::Blocked => output::warning(&line),
                _ => output::failure(&line),
            }
        }

        _ => {}
    }
}

fn print_summary(report: &PipelineReport) {
    println!();
    for run in &report.runs {
        output::job_line(run);
    }
    for (job, reason) in &report.excluded {
        output::dim(&format!("  -  {:<24} not included ({})", job, reason));
    }
    for error in &report.rule_errors {
        output::warning(&error.to_string());
    }
    for (notifier, error) in &report.notification_errors {
        output::warning(&format!("Notification via {} failed: {}", notifier, error));
    }
}
