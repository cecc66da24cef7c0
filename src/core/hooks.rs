use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

use crate::core::models::JobConfig;

/// Called once after a transfer run finishes with every step `ok`.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn transfer_completed(&self, job: &JobConfig);
}

/// Default hook: records the completion in the diagnostic log.
#[derive(Debug, Default)]
pub struct LogCompletion;

#[async_trait]
impl CompletionHook for LogCompletion {
    async fn transfer_completed(&self, job: &JobConfig) {
        info!(
            job_id = %job.job_id,
            destination = %job.destination.display(),
            "Transfer completed"
        );
    }
}

/// Opens the destination in the desktop file browser.
#[derive(Debug, Default)]
pub struct OpenDestination;

impl OpenDestination {
    fn opener() -> &'static str {
        if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        }
    }

    fn open(path: &Path) {
        match Command::new(Self::opener()).arg(path).spawn() {
            Ok(_) => info!(path = %path.display(), "Opened destination"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to open destination"),
        }
    }
}

#[async_trait]
impl CompletionHook for OpenDestination {
    async fn transfer_completed(&self, job: &JobConfig) {
        LogCompletion.transfer_completed(job).await;
        Self::open(&job.destination);
    }
}
