// Docker Runtime
// Executes job scripts inside Docker containers through the docker CLI

use crate::runners::{ContainerRuntime, RunOutput, RunRequest, RuntimeError};
use crate::utils::short_id;

use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Configuration for container execution
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// docker binary (name on `PATH` or absolute path)
    pub docker_bin: String,
    /// Whether to pull images before running
    pub pull_policy: ImagePullPolicy,
    /// Extra flags passed to `docker create`
    pub extra_args: Vec<String>,
    /// Prefix of container names
    pub name_prefix: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            extra_args: Vec::new(),
            name_prefix: "stagehand".to_string(),
        }
    }
}

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Removes the container when dropped, including when the job task is aborted
struct ContainerGuard {
    docker_bin: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = std::process::Command::new(&self.docker_bin)
            .args(["rm", "-f", self.name.as_str()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
    }
}

/// Runtime executing each job in a fresh container
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    config: DockerConfig,
}

impl DockerRuntime {
    /// Create a docker runtime with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn docker(&self) -> Command {
        Command::new(&self.config.docker_bin)
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RuntimeError> {
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let output = self
                    .docker()
                    .args(["image", "inspect", image])
                    .output()
                    .await
                    .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

                if output.status.success() {
                    Ok(())
                } else {
                    self.pull_image(image).await
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "pulling image");
        let output = self
            .docker()
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::PullFailed(format!(
                "{}: {}",
                image,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Arguments for `docker create`: the container idles until scripts are exec'd into it
    fn create_args(&self, name: &str, request: &RunRequest) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            request.workdir.clone(),
            "--entrypoint".to_string(),
            "tail".to_string(),
        ];

        for mount in &request.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg());
        }

        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-e".to_string());
        args.push(format!("CI_PROJECT_DIR={}", request.workdir));

        args.extend(self.config.extra_args.iter().cloned());

        args.push(request.image.clone());
        args.push("-f".to_string());
        args.push("/dev/null".to_string());
        args
    }

    async fn start_container(&self, name: &str, request: &RunRequest) -> Result<(), RuntimeError> {
        let output = self
            .docker()
            .args(self.create_args(name, request))
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CreateFailed(stderr.trim().to_string()));
        }

        let output = self
            .docker()
            .args(["start", name])
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::StartFailed(stderr.trim().to_string()));
        }

        Ok(())
    }

    async fn exec_script(
        &self,
        name: &str,
        request: &RunRequest,
    ) -> Result<RunOutput, RuntimeError> {
        let mut cmd = self.docker();
        cmd.args(["exec", "-w", request.workdir.as_str(), name, "sh", "-c"]);
        cmd.arg(request.script_text());
        cmd.kill_on_drop(true);

        match tokio::time::timeout(request.timeout, cmd.output()).await {
            Ok(output) => {
                let output = output.map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
                Ok(RunOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
                    timed_out: false,
                })
            }
            Err(_) => Ok(RunOutput {
                stderr: format!("Process timed out after {:?}", request.timeout),
                ..RunOutput::timeout()
            }),
        }
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    /// Check if Docker is available
    async fn is_available(&self) -> bool {
        if which::which(&self.config.docker_bin).is_err() {
            return false;
        }

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            self.docker()
                .args(["version", "--format", "{{.Server.Version}}"])
                .output(),
        )
        .await;

        matches!(output, Ok(Ok(o)) if o.status.success())
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError> {
        if which::which(&self.config.docker_bin).is_err() {
            return Err(RuntimeError::Unavailable(format!(
                "'{}' not found on PATH",
                self.config.docker_bin
            )));
        }

        self.pull_image_if_needed(&request.image).await?;

        let name = container_name(&self.config.name_prefix, &request.job);
        let mut guard = ContainerGuard {
            docker_bin: self.config.docker_bin.clone(),
            name: name.clone(),
            armed: true,
        };

        debug!(job = %request.job, container = %name, image = %request.image, "starting container");
        self.start_container(&name, request).await?;

        let result = self.exec_script(&name, request).await;

        let removed = self
            .docker()
            .args(["rm", "-f", name.as_str()])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if removed {
            guard.disarm();
        } else {
            warn!(container = %name, "failed to remove container, retrying in background");
        }

        result
    }
}

/// Container name from a job name: `[a-zA-Z0-9_.-]` only, plus a unique suffix
fn container_name(prefix: &str, job: &str) -> String {
    let job: String = job
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}-{}", prefix, job.trim_matches('-'), short_id())
}
