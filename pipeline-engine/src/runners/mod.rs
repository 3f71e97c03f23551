// Runners Module
// Container runtimes that execute job scripts, and the bounded executor pool driving them

pub mod docker;
pub mod pool;
pub mod shell;

// Re-export key types
pub use docker::{DockerConfig, DockerRuntime, ImagePullPolicy};
pub use pool::{ArtifactSource, ExecutorPool, JobOutcome, JobTask};
pub use shell::ShellRuntime;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a runtime cannot execute a script at all.
///
/// A script that runs and exits non-zero is not an error; it is reported
/// through `RunOutput::exit_code`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Runtime is not available: {0}")]
    Unavailable(String),

    #[error("Failed to pull image: {0}")]
    PullFailed(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A host directory made visible to the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// `-v` argument for the docker CLI
    pub fn to_volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// One script execution
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Job name (used for container naming and logs)
    pub job: String,
    pub image: String,
    /// Commands, run in order; the first failing command stops the script
    pub script: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// Working directory inside the container
    pub workdir: String,
}

impl RunRequest {
    pub fn new(job: impl Into<String>, image: impl Into<String>, script: Vec<String>) -> Self {
        Self {
            job: job.into(),
            image: image.into(),
            script,
            mounts: Vec::new(),
            env: HashMap::new(),
            timeout: Duration::from_secs(3600),
            workdir: "/builds/project".to_string(),
        }
    }

    /// Script text passed to `sh -c`
    pub fn script_text(&self) -> String {
        let mut text = String::from("set -e\n");
        for line in &self.script {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    /// Host directory mounted at the working directory, if any
    pub fn host_workdir(&self) -> Option<&PathBuf> {
        self.mounts
            .iter()
            .find(|m| m.container == self.workdir)
            .or_else(|| self.mounts.first())
            .map(|m| &m.host)
    }
}

/// Output of one script execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code (`None` when killed or timed out)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Job trace: stdout followed by stderr
    pub fn trace(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Executes job scripts in an isolated environment
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for logs ("docker", "shell", ...)
    fn name(&self) -> &str;

    /// Whether the runtime can currently execute jobs
    async fn is_available(&self) -> bool;

    /// Run a script to completion.
    ///
    /// Implementations enforce `request.timeout` themselves and report it
    /// through `RunOutput::timed_out`; `Err` is reserved for failures to
    /// acquire or drive the environment.
    async fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError>;
}
