//! Error types for job execution.

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can fail a step.
#[derive(Error, Debug)]
pub enum JobError {
    /// Source path does not exist
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Source and destination resolve to the same directory
    #[error("Source and destination are identical: {}", .0.display())]
    IdenticalPaths(PathBuf),

    /// Destination lies inside the source tree
    #[error("Destination {} is nested within source {}", destination.display(), source_dir.display())]
    DestinationNested {
        source_dir: PathBuf,
        destination: PathBuf,
    },

    /// Not enough free space on the destination volume
    #[error("Insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    /// Destination directory could not be created
    #[error("Failed to create destination directory {}: {source}", path.display())]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Erase target does not exist
    #[error("Erase target not found: {}", .0.display())]
    EraseTargetNotFound(PathBuf),

    /// External tool exited with a status outside the accepted set
    #[error("{tool} exited with code {code}")]
    ToolFailed { tool: String, code: i32 },

    /// External tool could not be launched
    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The step was interrupted by stop()
    #[error("Cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Exit code recorded alongside an `end`/`error` log record.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::ToolFailed { code, .. } => *code,
            _ => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
