use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque job identifier, reissued for every fresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Transfer,
    Erase,
}

/// Ordered, mode-specific pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    ValidatePaths,
    CheckSpace,
    PrepareDest,
    PlanDryrun,
    CopyRun,
    PostVerify,
    Finalize,
    Confirm,
    DeleteRun,
}

impl StepId {
    pub const TRANSFER: [StepId; 7] = [
        StepId::ValidatePaths,
        StepId::CheckSpace,
        StepId::PrepareDest,
        StepId::PlanDryrun,
        StepId::CopyRun,
        StepId::PostVerify,
        StepId::Finalize,
    ];

    pub const ERASE: [StepId; 2] = [StepId::Confirm, StepId::DeleteRun];

    pub fn sequence(mode: Mode) -> &'static [StepId] {
        match mode {
            Mode::Transfer => &Self::TRANSFER,
            Mode::Erase => &Self::ERASE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidatePaths => "validate_paths",
            Self::CheckSpace => "check_space",
            Self::PrepareDest => "prepare_dest",
            Self::PlanDryrun => "plan_dryrun",
            Self::CopyRun => "copy_run",
            Self::PostVerify => "post_verify",
            Self::Finalize => "finalize",
            Self::Confirm => "confirm",
            Self::DeleteRun => "delete_run",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validate_paths" => Some(Self::ValidatePaths),
            "check_space" => Some(Self::CheckSpace),
            "prepare_dest" => Some(Self::PrepareDest),
            "plan_dryrun" => Some(Self::PlanDryrun),
            "copy_run" => Some(Self::CopyRun),
            "post_verify" => Some(Self::PostVerify),
            "finalize" => Some(Self::Finalize),
            "confirm" => Some(Self::Confirm),
            "delete_run" => Some(Self::DeleteRun),
            _ => None,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl ControlState {
    /// Whether a new run may begin from this state.
    pub fn accepts_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Paused | Self::Stopped)
    }
}

/// Where a run begins in the step sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    /// Always begin at the first step.
    #[default]
    Restart,
    /// Continue after the last step the event log records as `ok` for this job.
    ResumeFromLog,
}

/// Configuration of the current job. Replaced only when a new run is started.
#[derive(Debug, Clone, Serialize)]
pub struct JobConfig {
    pub job_id: JobId,
    pub mode: Mode,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub erase_target: Option<PathBuf>,
    pub log_file: PathBuf,
}

impl JobConfig {
    pub fn new(source: PathBuf, destination: PathBuf, log_file: PathBuf) -> Self {
        Self {
            job_id: JobId::new(),
            mode: Mode::Transfer,
            source,
            destination,
            erase_target: None,
            log_file,
        }
    }
}

/// How a call to `start`/`start_erase` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Control state did not accept a new run.
    Rejected,
    /// Every step finished `ok`.
    Completed,
    /// A step failed; the pipeline stopped there.
    Failed { step: StepId, message: String },
    /// The loop exited because of pause() or stop() between steps.
    Halted(ControlState),
}
