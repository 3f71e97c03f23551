// Image Registry
// Keep-last-N retention for images built by pipelines, backed by a registry client

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Errors raised by a registry client
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry is not available: {0}")]
    Unavailable(String),

    #[error("Failed to list images: {0}")]
    ListFailed(String),

    #[error("Failed to delete {image}: {message}")]
    DeleteFailed { image: String, message: String },

    #[error("Unexpected registry output: {0}")]
    InvalidOutput(String),
}

/// One image (repository + tag) known to a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    /// Content identifier (image id or digest)
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl ImageRef {
    /// `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Client for a store of container images
#[async_trait::async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Images belonging to `project` (a repository name or prefix)
    async fn list_images(&self, project: &str) -> Result<Vec<ImageRef>, RegistryError>;

    async fn delete_image(&self, image: &ImageRef) -> Result<(), RegistryError>;
}

/// Which images survive a prune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest images kept per repository
    pub keep_last: usize,
}

impl RetentionPolicy {
    pub fn keep_last(n: usize) -> Self {
        Self { keep_last: n }
    }

    /// Images to delete: everything but the newest `keep_last` per repository.
    ///
    /// Images are ordered by `created_at` (ties broken by tag); the result is
    /// oldest first.
    pub fn select_for_deletion(&self, images: &[ImageRef]) -> Vec<ImageRef> {
        let mut by_repository: HashMap<&str, Vec<&ImageRef>> = HashMap::new();
        for image in images {
            by_repository
                .entry(image.repository.as_str())
                .or_default()
                .push(image);
        }

        let mut doomed = Vec::new();
        for (_, mut group) in by_repository {
            group.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.tag.cmp(&a.tag))
            });
            doomed.extend(group.into_iter().skip(self.keep_last).cloned());
        }

        doomed.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reference().cmp(&b.reference()))
        });
        doomed
    }
}

/// Outcome of a prune
#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<ImageRef>,
    pub kept: usize,
    pub failures: Vec<(ImageRef, RegistryError)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete the images of `project` that `policy` does not retain.
///
/// Individual delete failures are recorded and do not stop the prune.
pub async fn prune_images(
    registry: &dyn ImageRegistry,
    project: &str,
    policy: RetentionPolicy,
) -> Result<PruneReport, RegistryError> {
    let images = registry.list_images(project).await?;
    let doomed = policy.select_for_deletion(&images);

    let mut report = PruneReport {
        kept: images.len() - doomed.len(),
        ..Default::default()
    };

    for image in doomed {
        match registry.delete_image(&image).await {
            Ok(()) => {
                info!(image = %image.reference(), "deleted image");
                report.deleted.push(image);
            }
            Err(e) => {
                warn!(image = %image.reference(), error = %e, "failed to delete image");
                report.failures.push((image, e));
            }
        }
    }

    Ok(report)
}

/// Registry client for the local docker image store
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    docker_bin: String,
}

impl Default for DockerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of `docker image ls --format '{{json .}}'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerImageLine {
    repository: String,
    tag: String,
    #[serde(rename = "ID")]
    id: String,
    created_at: String,
}

impl DockerRegistry {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    pub fn with_binary(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    fn parse_listing(output: &str) -> Result<Vec<ImageRef>, RegistryError> {
        let mut images = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let entry: DockerImageLine = serde_json::from_str(line)
                .map_err(|e| RegistryError::InvalidOutput(format!("{}: {}", e, line)))?;
            if entry.tag == "<none>" {
                continue;
            }
            images.push(ImageRef {
                created_at: parse_docker_timestamp(&entry.created_at)?,
                repository: entry.repository,
                tag: entry.tag,
                id: entry.id,
            });
        }
        Ok(images)
    }
}

/// Parse docker's `2024-05-01 10:20:30 +0200 CEST` timestamps
fn parse_docker_timestamp(value: &str) -> Result<DateTime<Utc>, RegistryError> {
    let head: Vec<&str> = value.split_whitespace().take(3).collect();
    DateTime::parse_from_str(&head.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::InvalidOutput(format!("timestamp '{}': {}", value, e)))
}

#[async_trait::async_trait]
impl ImageRegistry for DockerRegistry {
    async fn list_images(&self, project: &str) -> Result<Vec<ImageRef>, RegistryError> {
        let output = Command::new(&self.docker_bin)
            .args(["image", "ls", "--format", "{{json .}}", project])
            .output()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RegistryError::ListFailed(stderr.trim().to_string()));
        }

        Self::parse_listing(&String::from_utf8_lossy(&output.stdout))
    }

    async fn delete_image(&self, image: &ImageRef) -> Result<(), RegistryError> {
        let reference = image.reference();
        let output = Command::new(&self.docker_bin)
            .args(["image", "rm", reference.as_str()])
            .output()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RegistryError::DeleteFailed {
                image: reference,
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}
