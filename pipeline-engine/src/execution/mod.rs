// Execution Module
// Job graph construction, scheduling state machine and the pipeline controller

pub mod controller;
pub mod events;
pub mod graph;
pub mod scheduler;

// Re-export key types
pub use controller::{
    ControlError, ControlSignal, PipelineController, PipelineHandle, PipelineReport, Trigger,
};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use graph::{Edge, EdgeKind, GraphError, GraphErrorKind, JobGraph, JobNode, PlannedJob};
pub use scheduler::{
    FailureCause, JobRun, JobStatus, PipelineStatus, RunResult, Scheduler, SchedulerError,
};
