pub mod event_log;
pub mod hooks;
pub mod manager;
pub mod models;
pub mod parser;
pub mod progress;
pub mod runner;
pub mod steps;

pub use event_log::{EventLog, LogEvent, LogRecord, RecordStatus, resume_point};
pub use hooks::{CompletionHook, LogCompletion, OpenDestination};
pub use manager::JobManager;
pub use models::{
    ControlState, JobConfig, JobId, Mode, RunOutcome, RunPolicy, StepId, StepStatus,
};
pub use parser::{LineParser, ProgressEvent, RsyncLineParser};
pub use progress::{CopyLogEntry, ProgressSnapshot, ProgressTracker};
pub use runner::{Invocation, ProcessRunner, ToolProcess};
pub use steps::{PlanStep, RsyncPlan, SkipPlan, StepContext};
