use crate::commands::{load_pipeline, parse_event, parse_variables};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use pipeline_engine::execution::EdgeKind;
use pipeline_engine::parser::When;
use pipeline_engine::{JobGraph, PipelineValidator, RuleContext, RuleDecision, RuleEvaluator};

/// Show the jobs a trigger would run, stage by stage, with their dependencies
#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[arg(long, short = 'b', default_value = "main", conflicts_with = "tag")]
    pub branch: String,

    #[arg(long)]
    pub tag: Option<String>,

    #[arg(long, default_value = "push")]
    pub event: String,

    #[arg(long)]
    pub schedule: bool,

    /// Changed path for `changes:` rules (can be repeated)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed: Vec<String>,

    /// Set a variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub variables: Vec<String>,
}

pub fn execute(args: GraphArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    PipelineValidator::validate(&pipeline).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        eyre!("pipeline is invalid:\n  {}", messages.join("\n  "))
    })?;

    let mut context = match &args.tag {
        Some(tag) => RuleContext::for_tag(tag),
        None => RuleContext::for_branch(&args.branch),
    }
    .with_event(parse_event(&args.event)?)
    .with_schedule(args.schedule);
    if !args.changed.is_empty() {
        context = context.with_changed_paths(args.changed.clone());
    }
    context.variables = parse_variables(&args.variables)?;

    let evaluation = RuleEvaluator::new(&context, &pipeline.variables).evaluate_pipeline(&pipeline);
    let graph = JobGraph::from_pipeline(&pipeline, &evaluation)?;

    output::header(&format!(
        "{} ({}, {} jobs)",
        context.ref_name(),
        context.pipeline_source(),
        graph.len()
    ));

    for stage in graph.active_stages() {
        let jobs: Vec<_> = graph.jobs_in_stage(stage).collect();
        output::stage_header(stage, jobs.len());
        for node in jobs {
            let mut flags = Vec::new();
            if node.when != When::OnSuccess {
                flags.push(node.when.as_str().to_string());
            }
            if node.allow_failure {
                flags.push("allow_failure".to_string());
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            println!("    {}{}", node.name, flags);

            let needs: Vec<&str> = node
                .dependencies
                .iter()
                .filter(|edge| edge.kind == EdgeKind::Needs)
                .map(|edge| graph.node(edge.upstream).name.as_str())
                .collect();
            if !needs.is_empty() {
                output::dim(&format!("      needs: {}", needs.join(", ")));
            }
        }
    }

    for (job, decision) in &evaluation.decisions {
        if let RuleDecision::Exclude { reason } = decision {
            output::dim(&format!("  excluded: {} ({})", job, reason));
        }
    }
    for error in &evaluation.errors {
        output::warning(&error.to_string());
    }

    Ok(())
}
