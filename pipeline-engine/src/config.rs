// Engine Configuration
// Tunables for scheduling, execution and retries

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs executing at the same time (minimum 1)
    pub max_parallel_jobs: usize,
    /// Timeout applied to jobs that do not declare `timeout`
    pub default_timeout: Duration,
    /// Extra attempts after an infrastructure error before the job fails
    pub infra_retries: u32,
    /// Delay between infrastructure retries
    pub infra_retry_backoff: Duration,
    /// Timeout for `after_script`
    pub after_script_timeout: Duration,
    /// Keep the pipeline open while manual jobs wait for approval
    pub wait_for_manual: bool,
    /// Host directory mounted as the job workspace
    pub workspace_dir: PathBuf,
    /// Path the workspace is mounted at inside job containers
    pub container_workdir: String,
    /// Image used when neither the job nor `default` declares one
    pub default_image: String,
    /// Branch reported as `CI_DEFAULT_BRANCH`
    pub default_branch: String,
    /// Expiry for artifacts that do not declare `expire_in`
    pub default_artifact_expiry: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            default_timeout: Duration::from_secs(3600),
            infra_retries: 2,
            infra_retry_backoff: Duration::from_secs(1),
            after_script_timeout: Duration::from_secs(300),
            wait_for_manual: false,
            workspace_dir: PathBuf::from("."),
            container_workdir: "/builds/project".to_string(),
            default_image: "alpine:latest".to_string(),
            default_branch: "main".to_string(),
            default_artifact_expiry: Some(Duration::from_secs(30 * 86_400)),
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel_jobs(mut self, jobs: usize) -> Self {
        self.max_parallel_jobs = jobs.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_infra_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.infra_retries = retries;
        self.infra_retry_backoff = backoff;
        self
    }

    pub fn with_wait_for_manual(mut self, wait: bool) -> Self {
        self.wait_for_manual = wait;
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }
}
