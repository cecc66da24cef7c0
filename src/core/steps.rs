//! Bodies of the individual pipeline steps.
//!
//! Configuration and resource checks run in-process; copy, verify and delete
//! are delegated to the external tools through [`ProcessRunner`].

use async_trait::async_trait;
use nix::sys::statvfs::statvfs;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::core::models::JobConfig;
use crate::core::parser::{LineParser, ProgressEvent};
use crate::core::progress::ProgressTracker;
use crate::core::runner::{Invocation, ProcessRunner};
use crate::error::{JobError, Result};
use crate::logging::LogThrottle;

const LINE_BUFFER: usize = 256;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Everything a step body may touch.
pub struct StepContext<'a> {
    pub job: &'a JobConfig,
    pub config: &'a AppConfig,
    pub progress: &'a ProgressTracker,
    pub runner: &'a ProcessRunner,
    pub parser: &'a dyn LineParser,
}

/// The `plan_dryrun` step. Swappable so the preview can be turned on
/// without touching the pipeline.
#[async_trait]
pub trait PlanStep: Send + Sync {
    async fn plan(&self, ctx: &StepContext<'_>) -> Result<()>;
}

/// Default plan step: does nothing. A full dry run over a large tree can take
/// as long as the copy itself.
#[derive(Debug, Default)]
pub struct SkipPlan;

#[async_trait]
impl PlanStep for SkipPlan {
    async fn plan(&self, ctx: &StepContext<'_>) -> Result<()> {
        debug!(job_id = %ctx.job.job_id, "Dry-run preview disabled, skipping");
        Ok(())
    }
}

/// Runs rsync's itemized dry run and shows each pending file as the current file.
#[derive(Debug, Default)]
pub struct RsyncPlan;

#[async_trait]
impl PlanStep for RsyncPlan {
    async fn plan(&self, ctx: &StepContext<'_>) -> Result<()> {
        let invocation = Invocation::rsync_dry_run(
            &ctx.config.rsync_binary(),
            &ctx.job.source,
            &ctx.job.destination,
        );

        let mut process = ctx.runner.spawn(&invocation)?;
        let mut pending = 0u64;
        while let Some(line) = process.next_line().await {
            if let Some(ProgressEvent::CurrentFile(file)) = ctx.parser.parse(&line) {
                pending += 1;
                ctx.progress.set_current_file(file).await;
            }
        }
        process.wait().await?;

        info!(job_id = %ctx.job.job_id, pending_files = pending, "Dry-run preview complete");
        Ok(())
    }
}

/// Source must exist, differ from the destination, and not contain it.
pub fn validate_paths(source: &Path, destination: &Path) -> Result<()> {
    if !source.exists() {
        return Err(JobError::SourceNotFound(source.to_path_buf()));
    }

    let src = resolve_path(source);
    let dst = resolve_path(destination);

    if src == dst {
        return Err(JobError::IdenticalPaths(src));
    }
    if dst.starts_with(&src) {
        return Err(JobError::DestinationNested {
            source_dir: src,
            destination: dst,
        });
    }
    Ok(())
}

/// Absolute, symlink-resolved form of a path that may not exist yet.
///
/// The longest existing prefix is canonicalized and the remaining components
/// are appended after lexical normalization.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let normalized = normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Total size of regular files below `root`, skipping hidden entries.
///
/// Unreadable entries are ignored. Symlinks are not followed.
pub fn source_size(root: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(root) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }

    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
    }
    total
}

/// Bytes available to unprivileged users on the volume holding `path`.
///
/// `path` need not exist; its nearest existing ancestor is queried.
pub fn free_space(path: &Path) -> Result<u64> {
    let resolved = resolve_path(path);
    let probe = resolved
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(Path::new("/"));

    let stats = statvfs(probe).map_err(std::io::Error::from)?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}

pub async fn check_space(ctx: &StepContext<'_>) -> Result<()> {
    let source = ctx.job.source.clone();
    let required = tokio::task::spawn_blocking(move || source_size(&source))
        .await
        .map_err(|e| JobError::Io(std::io::Error::other(e)))?;
    let available = free_space(&ctx.job.destination)?;

    info!(
        job_id = %ctx.job.job_id,
        required_bytes = required,
        available_bytes = available,
        "Space check"
    );

    if required > available {
        return Err(JobError::InsufficientSpace {
            required,
            available,
        });
    }

    ctx.progress.set_total(required).await;
    Ok(())
}

/// Create the destination and any missing parents. Idempotent.
pub async fn prepare_dest(destination: &Path) -> Result<()> {
    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|source| JobError::CreateDestination {
            path: destination.to_path_buf(),
            source,
        })
}

/// Live copy. Parsed output flows from the runner over a channel and is applied
/// to the tracker by this task alone.
pub async fn copy_run(ctx: &StepContext<'_>) -> Result<()> {
    let invocation = Invocation::rsync_copy(
        &ctx.config.rsync_binary(),
        &ctx.job.source,
        &ctx.job.destination,
    );

    let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
    let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);

    let consume = async {
        while let Some(line) = rx.recv().await {
            let Some(event) = ctx.parser.parse(&line) else {
                continue;
            };
            ctx.progress.apply(&event, &ctx.job.source).await;

            if throttle.should_log() {
                let snap = ctx.progress.snapshot().await;
                debug!(
                    job_id = %ctx.job.job_id,
                    bytes_done = snap.bytes_done,
                    total_bytes = ?snap.total_bytes,
                    speed_bps = snap.speed_bps,
                    current_file = ?snap.current_file,
                    "Copy progress"
                );
            }
        }
    };

    let (result, ()) = tokio::join!(ctx.runner.run(&invocation, tx), consume);
    let exit_code = result?;

    let snap = ctx.progress.snapshot().await;
    info!(
        job_id = %ctx.job.job_id,
        exit_code,
        bytes_done = snap.bytes_done,
        files_seen = snap.history.len(),
        "Copy complete"
    );
    Ok(())
}

/// Re-run rsync as a dry run; only its exit status matters.
pub async fn post_verify(ctx: &StepContext<'_>) -> Result<()> {
    let invocation = Invocation::rsync_dry_run(
        &ctx.config.rsync_binary(),
        &ctx.job.source,
        &ctx.job.destination,
    );

    let mut process = ctx.runner.spawn(&invocation)?;
    while process.next_line().await.is_some() {}
    process.wait().await?;

    info!(job_id = %ctx.job.job_id, "Post-copy verification passed");
    Ok(())
}

pub async fn finalize(ctx: &StepContext<'_>) -> Result<()> {
    info!(
        job_id = %ctx.job.job_id,
        destination = %ctx.job.destination.display(),
        "Transfer finalized"
    );
    Ok(())
}

pub fn confirm(target: &Path) -> Result<()> {
    // symlink_metadata so a dangling link can still be erased
    if std::fs::symlink_metadata(target).is_err() {
        return Err(JobError::EraseTargetNotFound(target.to_path_buf()));
    }
    Ok(())
}

pub async fn delete_run(ctx: &StepContext<'_>, target: &Path) -> Result<()> {
    let invocation = Invocation::remove_recursive(&ctx.config.rm_path, target);
    let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);

    let consume = async {
        while let Some(line) = rx.recv().await {
            debug!(job_id = %ctx.job.job_id, output = %line, "rm output");
        }
    };

    let (result, ()) = tokio::join!(ctx.runner.run(&invocation, tx), consume);
    result?;

    info!(job_id = %ctx.job.job_id, target = %target.display(), "Erase complete");
    Ok(())
}
