use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::models::RunPolicy;
use crate::core::progress::DEFAULT_HISTORY_LIMIT;

const DEFAULT_CONFIG_FILE: &str = "lyracopy.toml";
const ENV_PREFIX: &str = "LYRACOPY_";

/// Locations checked, in order, when no rsync binary is configured.
const RSYNC_CANDIDATES: [&str; 3] = [
    "/usr/local/bin/rsync",
    "/opt/homebrew/bin/rsync",
    "/usr/bin/rsync",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// JSON Lines event log
    pub log_file: PathBuf,
    /// Explicit rsync binary; detected when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync_path: Option<PathBuf>,
    pub rm_path: PathBuf,
    pub run_policy: RunPolicy,
    /// Run the itemized dry-run preview before copying
    pub dry_run_preview: bool,
    /// Milliseconds between SIGTERM and SIGKILL on stop
    pub stop_grace_ms: u64,
    pub history_limit: usize,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("lyracopy.jsonl"),
            rsync_path: None,
            rm_path: PathBuf::from("rm"),
            run_policy: RunPolicy::Restart,
            dry_run_preview: false,
            stop_grace_ms: 1000,
            history_limit: DEFAULT_HISTORY_LIMIT,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `LYRACOPY_*` environment and CLI overrides.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", file.display()))
    }

    /// The rsync binary to launch.
    pub fn rsync_binary(&self) -> PathBuf {
        if let Some(path) = &self.rsync_path {
            return path.clone();
        }
        RSYNC_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("rsync"))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
