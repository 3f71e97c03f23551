use crate::commands::load_pipeline;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{JobGraph, PipelineValidator, RuleContext, RuleEvaluator};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Branch used to check that rules evaluate and the job graph builds
    #[arg(long, default_value = "main")]
    pub branch: String,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.display()));

    // Step 1: Parse YAML syntax
    let pipeline = match load_pipeline(&args.pipeline) {
        Ok(p) => p,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");
    output::check(&format!(
        "Structure: {} stages, {} jobs",
        pipeline.stages.len(),
        pipeline.jobs.len()
    ));

    // Step 2: Semantic validation (references, cycles, stages)
    if let Err(errors) = PipelineValidator::validate(&pipeline) {
        output::error(&format!("{} validation error(s):", errors.len()));
        for error in &errors {
            output::error(&format!("  - [{}] {}", error.path, error.message));
            if let Some(suggestion) = &error.suggestion {
                output::info(&format!("    Suggestion: {}", suggestion));
            }
        }
        std::process::exit(1);
    }
    output::check("Semantic validation passed");

    // Step 3: Rules and graph for a representative trigger
    let context = RuleContext::for_branch(&args.branch);
    let evaluation = RuleEvaluator::new(&context, &pipeline.variables).evaluate_pipeline(&pipeline);
    for error in &evaluation.errors {
        output::warning(&error.to_string());
    }

    match JobGraph::from_pipeline(&pipeline, &evaluation) {
        Ok(graph) => output::check(&format!(
            "Job graph for branch '{}': {} of {} jobs included",
            args.branch,
            graph.len(),
            pipeline.jobs.len()
        )),
        Err(e) => {
            output::error(&format!("Job graph error: {}", e));
            std::process::exit(1);
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
