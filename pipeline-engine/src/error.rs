// Engine Errors
// Top-level error type returned by the pipeline controller and its helpers

use crate::execution::graph::GraphError;
use crate::parser::error::{ParseError, ValidationError};

use thiserror::Error;

/// Errors that stop a pipeline before any job runs.
///
/// Everything that happens after the graph is built (script failures,
/// infrastructure errors, timeouts, notification failures) is scoped to a
/// single JobRun or logged, and is reported through the `PipelineReport`
/// rather than through this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("pipeline is invalid: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("pipeline has no jobs for this trigger")]
    EmptyPipeline,
}

impl EngineError {
    /// Whether this error is a validation failure of the pipeline definition
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Graph(_))
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
