//! Append-only JSON Lines log of step lifecycle events.
//!
//! Appends are queued to a single writer task per log file, so on-disk order
//! always matches call order and a slow disk never stalls the caller. Each
//! record is one self-contained line; a torn final line only loses itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::models::{JobId, StepId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEvent {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Error,
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub job_id: String,
    pub step_id: String,
    pub event: LogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogRecord {
    pub fn start(job_id: JobId, step: StepId) -> Self {
        Self {
            ts: Utc::now(),
            job_id: job_id.to_string(),
            step_id: step.as_str().to_string(),
            event: LogEvent::Start,
            status: None,
            exit_code: None,
            bytes_done: None,
            speed: None,
            message: None,
        }
    }

    pub fn end_ok(job_id: JobId, step: StepId) -> Self {
        Self {
            event: LogEvent::End,
            status: Some(RecordStatus::Ok),
            exit_code: Some(0),
            ..Self::start(job_id, step)
        }
    }

    pub fn end_error(job_id: JobId, step: StepId, exit_code: i32, message: String) -> Self {
        Self {
            event: LogEvent::End,
            status: Some(RecordStatus::Error),
            exit_code: Some(exit_code),
            message: Some(message),
            ..Self::start(job_id, step)
        }
    }

    pub fn with_transfer(mut self, bytes_done: u64, speed: u64) -> Self {
        self.bytes_done = Some(bytes_done);
        self.speed = Some(speed);
        self
    }

    pub fn step(&self) -> Option<StepId> {
        StepId::from_str(&self.step_id)
    }

    pub fn is_ok_end(&self) -> bool {
        self.event == LogEvent::End && self.status == Some(RecordStatus::Ok)
    }
}

enum WriterCommand {
    Append(LogRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to a log file. Cheap to clone; all clones share one writer task.
#[derive(Clone)]
pub struct EventLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl EventLog {
    /// Open (creating if needed) a log file and start its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record for writing. Never blocks and never fails the caller.
    pub fn append(&self, record: LogRecord) {
        if self.tx.send(WriterCommand::Append(record)).is_err() {
            warn!(path = %self.path.display(), "Event log writer is gone, record dropped");
        }
    }

    /// Wait until every record appended before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Read every well-formed record in file order.
    pub async fn read_all(&self) -> Result<Vec<LogRecord>> {
        read_records(&self.path).await
    }

    /// Last step recorded as `end`/`ok` for `job_id`, in log order.
    pub async fn resume_point(&self, job_id: JobId) -> Result<Option<StepId>> {
        self.flush().await;
        let records = self.read_all().await?;
        Ok(resume_point(&records, job_id))
    }
}

/// Replay `records` and return the most recent successfully completed step of `job_id`.
pub fn resume_point(records: &[LogRecord], job_id: JobId) -> Option<StepId> {
    let job_id = job_id.to_string();
    records
        .iter()
        .filter(|r| r.job_id == job_id && r.is_ok_end())
        .filter_map(LogRecord::step)
        .last()
}

/// Read a JSON Lines log, skipping blank and malformed lines.
pub async fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let content = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&content);

    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => debug!(line = idx + 1, error = %e, "Skipping malformed log line"),
        }
    }
    Ok(records)
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open event log");
            None
        }
    };

    // A crash can leave a torn final line; new records must not extend it.
    if let Some(f) = file.as_mut() {
        match ends_mid_line(&path).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(path = %path.display(), "Terminating torn final line");
                if let Err(e) = f.write_all(b"\n").await {
                    warn!(path = %path.display(), error = %e, "Failed to terminate torn line");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to inspect event log"),
        }
    }

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Append(record) => {
                let Some(f) = file.as_mut() else { continue };
                let mut line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize log record");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "Failed to write log record");
                }
            }
            WriterCommand::Flush(done) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.flush().await {
                        warn!(path = %path.display(), error = %e, "Failed to flush event log");
                    }
                }
                let _ = done.send(());
            }
        }
    }
}

/// True when the file is non-empty and its last byte is not a newline.
async fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}
