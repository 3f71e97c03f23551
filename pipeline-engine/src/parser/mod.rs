// Parser module for stage/job pipeline files
// Provides YAML parsing, `extends` resolution and validation

pub mod error;
pub mod models;
pub mod yaml;

pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use models::*;
pub use yaml::{PipelineParser, PipelineValidator};
