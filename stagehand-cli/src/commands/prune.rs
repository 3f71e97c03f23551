use crate::output;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use pipeline_engine::registry::ImageRegistry;
use pipeline_engine::{prune_images, DockerRegistry, RetentionPolicy};

/// Delete all but the newest images of a project from the local docker image store
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Repository (or repository prefix) whose images are pruned
    pub project: String,

    /// Number of newest images to keep per repository
    #[arg(long, default_value_t = 10)]
    pub keep: usize,

    /// Only list the images that would be deleted
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: PruneArgs) -> Result<()> {
    let registry = DockerRegistry::new();
    let policy = RetentionPolicy::keep_last(args.keep);

    if args.dry_run {
        let images = registry.list_images(&args.project).await?;
        let doomed = policy.select_for_deletion(&images);
        output::info(&format!(
            "{} of {} images would be deleted",
            doomed.len(),
            images.len()
        ));
        for image in doomed {
            output::dim(&format!(
                "  {} ({}, {})",
                image.reference(),
                image.id,
                image.created_at.format("%Y-%m-%d %H:%M")
            ));
        }
        return Ok(());
    }

    output::status("Pruning", &format!("{} (keeping {})", args.project, args.keep));
    let report = prune_images(&registry, &args.project, policy).await?;

    for image in &report.deleted {
        output::check(&format!("deleted {}", image.reference()));
    }
    for (image, error) in &report.failures {
        output::failure(&format!("{}: {}", image.reference(), error));
    }
    output::info(&format!(
        "{} deleted, {} kept, {} failed",
        report.deleted.len(),
        report.kept,
        report.failures.len()
    ));

    if !report.is_clean() {
        bail!("some images could not be deleted");
    }
    Ok(())
}
