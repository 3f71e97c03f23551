// Pipeline Engine Library
// Rule evaluation, job graph scheduling, container execution and artifact storage for stagehand

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod notify;
pub mod parser;
pub mod registry;
pub mod rules;
pub mod runners;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

// Re-export parser types
pub use parser::{
    ParseError, ParseErrorKind, ParseResult, PipelineDefinition, PipelineParser,
    PipelineValidator, ValidationError,
};

// Re-export rule types
pub use rules::{RuleContext, RuleDecision, RuleEvaluation, RuleEvaluator, TriggerEvent};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, FailureCause, JobGraph, JobRun, JobStatus,
    PipelineController, PipelineHandle, PipelineReport, PipelineStatus, ProgressReceiver,
    ProgressSender, Scheduler, Trigger,
};

// Re-export runtime types
pub use runners::{ContainerRuntime, DockerRuntime, ExecutorPool, RunOutput, RunRequest, ShellRuntime};

// Re-export store and integration types
pub use notify::{LogNotifier, Notifier, PipelineSummary, WebhookNotifier};
pub use registry::{prune_images, DockerRegistry, ImageRegistry, RetentionPolicy};
pub use store::{ArtifactKind, ArtifactStore, Bundle, StoreError};
