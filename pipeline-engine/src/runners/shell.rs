// Shell Runtime
// Runs job scripts directly on the host with `sh -c` (image is ignored)

use crate::runners::{ContainerRuntime, RunOutput, RunRequest, RuntimeError};

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Shells the runtime can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// POSIX `sh`
    Sh,
    Bash,
}

impl Shell {
    fn program(&self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
        }
    }
}

/// Runtime executing scripts as local processes.
///
/// Intended for development and tests: there is no isolation, the job's
/// image is ignored and the working directory is the host side of the
/// workspace mount.
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    shell: Shell,
    /// Used when the request carries no mounts
    fallback_dir: PathBuf,
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self {
            shell: Shell::Sh,
            fallback_dir: PathBuf::from("."),
        }
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = dir.into();
        self
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for ShellRuntime {
    fn name(&self) -> &str {
        "shell"
    }

    async fn is_available(&self) -> bool {
        which::which(self.shell.program()).is_ok()
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError> {
        let work_dir = request
            .host_workdir()
            .cloned()
            .unwrap_or_else(|| self.fallback_dir.clone());

        debug!(job = %request.job, dir = %work_dir.display(), "running script in local shell");

        let mut cmd = Command::new(self.shell.program());
        cmd.arg("-c");
        cmd.arg(request.script_text());
        cmd.current_dir(&work_dir);
        cmd.envs(&request.env);
        cmd.env("CI_PROJECT_DIR", &work_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Aborting the job task must not leave the script running
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{}: {}", self.shell.program(), e)))?;

        // Read output streams concurrently
        let stdout_handle = child.stdout.take().map(|s| tokio::spawn(read_lines(s)));
        let stderr_handle = child.stderr.take().map(|s| tokio::spawn(read_lines(s)));

        let (exit_code, timed_out) =
            match tokio::time::timeout(request.timeout, child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    let _ = child.kill().await;
                    (None, true)
                }
            };

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let mut stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Process timed out after {:?}", request.timeout));
        }

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}
