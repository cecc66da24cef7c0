//! Live progress of the current run.
//!
//! The snapshot is written only by the running pipeline and read by any number
//! of observers (CLI status line, UI). Output from the external tool never
//! touches it directly: lines travel over a channel to the step that owns the
//! tracker, which applies them here. Nothing in this module is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::parser::ProgressEvent;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One distinct file seen during a copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    /// Overall bytes done when the file was first seen.
    pub bytes_done: u64,
    pub source_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    /// Unknown until the space check has measured the source.
    pub total_bytes: Option<u64>,
    pub speed_bps: u64,
    pub current_file: Option<String>,
    pub history: VecDeque<CopyLogEntry>,
    pub last_error: Option<String>,
}

impl ProgressSnapshot {
    /// Completion ratio in percent, when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_done as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Shared, lock-guarded handle to the snapshot.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<RwLock<ProgressSnapshot>>,
    history_limit: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ProgressTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProgressSnapshot::default())),
            history_limit: history_limit.max(1),
        }
    }

    /// A consistent copy of the current state.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.inner.read().await.clone()
    }

    /// Clear everything at the start of a run.
    pub async fn reset(&self) {
        *self.inner.write().await = ProgressSnapshot::default();
    }

    /// Record the measured source size; zero leaves the total unknown.
    pub async fn set_total(&self, total: u64) {
        let mut snap = self.inner.write().await;
        snap.total_bytes = (total > 0).then_some(total);
        snap.bytes_done = 0;
    }

    /// Advance bytes done. Values at or below the current count are ignored.
    pub async fn advance(&self, bytes_done: i64) -> bool {
        let mut snap = self.inner.write().await;
        advance_bytes(&mut snap, bytes_done)
    }

    pub async fn set_error(&self, message: String) {
        self.inner.write().await.last_error = Some(message);
    }

    /// Force bytes done to the total at successful completion.
    pub async fn complete(&self) {
        let mut snap = self.inner.write().await;
        if let Some(total) = snap.total_bytes {
            snap.bytes_done = total;
        }
    }

    /// Apply one parsed line from the live copy.
    pub async fn apply(&self, event: &ProgressEvent, source_root: &Path) {
        let mut snap = self.inner.write().await;
        match event {
            ProgressEvent::Progress {
                bytes_done,
                speed_bps,
            } => {
                if let Some(bytes) = bytes_done {
                    advance_bytes(&mut snap, *bytes);
                }
                if let Some(speed) = speed_bps {
                    snap.speed_bps = *speed;
                }
            }
            ProgressEvent::CurrentFile(file) => {
                snap.current_file = Some(file.clone());
                let file_name = Path::new(file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.clone());

                if snap.history.back().map(|e| e.file_name.as_str()) != Some(file_name.as_str()) {
                    let entry = CopyLogEntry {
                        timestamp: Utc::now(),
                        file_name,
                        bytes_done: snap.bytes_done,
                        source_path: source_root.join(file).to_string_lossy().into_owned(),
                    };
                    snap.history.push_back(entry);
                    while snap.history.len() > self.history_limit {
                        snap.history.pop_front();
                    }
                }
            }
            ProgressEvent::Noise => {}
        }
    }

    /// Show a file name without recording it in the history.
    pub async fn set_current_file(&self, file: String) {
        self.inner.write().await.current_file = Some(file);
    }
}

fn advance_bytes(snap: &mut ProgressSnapshot, bytes_done: i64) -> bool {
    match u64::try_from(bytes_done) {
        Ok(bytes) if bytes > snap.bytes_done => {
            snap.bytes_done = bytes;
            true
        }
        _ => false,
    }
}
