use crate::config::AppConfig;
use crate::core::ProgressTracker;
use std::sync::Arc;

/// Shared services handed to the job manager.
///
/// The event log is per job (`JobConfig::log_file`) and is opened by the
/// manager, not here.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let progress = ProgressTracker::new(config.history_limit);
        Self {
            config: Arc::new(config),
            progress,
        }
    }
}
