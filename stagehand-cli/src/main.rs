// Stagehand CLI
// Runs stage/job pipelines locally: rules, manual gates, artifacts and caches

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::{graph::GraphArgs, prune::PruneArgs, run::RunArgs, validate::ValidateArgs};

/// Run stage/job CI pipelines locally
#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline for a trigger
    Run(RunArgs),
    /// Validate a pipeline file
    Validate(ValidateArgs),
    /// Show the jobs and dependencies a trigger would run
    Graph(GraphArgs),
    /// Delete old images built by pipelines
    Prune(PruneArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STAGEHAND_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("stagehand=info,pipeline_engine=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Graph(args) => commands::graph::execute(args),
        Command::Prune(args) => commands::prune::execute(args).await,
    }
}
