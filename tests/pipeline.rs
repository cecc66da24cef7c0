//! End-to-end tests of the job pipeline.
//!
//! rsync is replaced by small shell scripts so the tests exercise the real
//! subprocess, parsing, logging and control paths without needing rsync.

use async_trait::async_trait;
use lyracopy::config::AppConfig;
use lyracopy::context::AppContext;
use lyracopy::core::{
    CompletionHook, ControlState, JobConfig, JobManager, LogEvent, LogRecord, RecordStatus,
    RunOutcome, RunPolicy, StepId, StepStatus, event_log,
};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::time::timeout;

/// Write an executable stand-in for rsync that logs each invocation.
fn fake_rsync(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("rsync");
    let calls = dir.join("calls.log");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\necho \"$*\" >> '{}'\n{}\n",
            calls.display(),
            body
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

struct Fixture {
    temp: TempDir,
    source: PathBuf,
    destination: PathBuf,
    log_file: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        let destination = temp.path().join("out/dest");
        let log_file = temp.path().join("job.jsonl");
        Self {
            temp,
            source,
            destination,
            log_file,
        }
    }

    fn tools(&self) -> &Path {
        self.temp.path()
    }

    fn config(&self, rsync: PathBuf) -> AppConfig {
        AppConfig {
            log_file: self.log_file.clone(),
            rsync_path: Some(rsync),
            stop_grace_ms: 200,
            ..AppConfig::default()
        }
    }

    fn manager(&self, config: AppConfig) -> JobManager {
        let job = JobConfig::new(
            self.source.clone(),
            self.destination.clone(),
            self.log_file.clone(),
        );
        JobManager::new(AppContext::new(config), job)
    }

    async fn records(&self) -> Vec<LogRecord> {
        event_log::read_records(&self.log_file).await.unwrap()
    }
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionHook for CountingHook {
    async fn transfer_completed(&self, _job: &JobConfig) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for_status(manager: &JobManager, step: StepId, status: StepStatus) {
    timeout(Duration::from_secs(5), async {
        while manager.step_status(step).await != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("step never reached expected status");
}

/// Every `end` must close an open `start` for the same job and step.
fn assert_well_formed(records: &[LogRecord]) {
    let mut open: HashMap<(String, String), usize> = HashMap::new();
    for r in records {
        let key = (r.job_id.clone(), r.step_id.clone());
        match r.event {
            LogEvent::Start => *open.entry(key).or_default() += 1,
            LogEvent::End => {
                let count = open.entry(key).or_default();
                assert!(*count > 0, "end without start: {:?}", r);
                *count -= 1;
            }
        }
    }
}

fn started_steps(records: &[LogRecord], job_id: &str) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.job_id == job_id && r.event == LogEvent::Start)
        .map(|r| r.step_id.clone())
        .collect()
}

#[tokio::test]
async fn empty_source_completes_every_step() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exit 0");
    let hook = Arc::new(CountingHook::default());
    let manager = fx.manager(fx.config(rsync)).with_completion_hook(hook.clone());

    let outcome = manager
        .start(Some(fx.source.clone()), Some(fx.destination.clone()))
        .await;

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(manager.control_state().await, ControlState::Idle);
    let statuses = manager.step_statuses().await;
    assert_eq!(statuses.len(), 7);
    assert!(statuses.iter().all(|(_, s)| *s == StepStatus::Ok));

    let snap = manager.progress().snapshot().await;
    assert_eq!(snap.total_bytes, None);
    assert_eq!(snap.bytes_done, 0);
    assert!(fx.destination.is_dir());
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

    let records = fx.records().await;
    assert_eq!(records.len(), 14);
    assert_well_formed(&records);
    assert!(records.iter().filter(|r| r.event == LogEvent::End).all(|r| r.is_ok_end()));

    // plan_dryrun is a no-op by default: copy and verify only
    let invoked = calls(fx.tools());
    assert_eq!(invoked.len(), 2);
    assert!(!invoked[0].contains("--dry-run"));
    assert!(invoked[1].contains("--dry-run"));
}

#[tokio::test]
async fn copy_progress_reaches_snapshot_and_log() {
    let fx = Fixture::new();
    std::fs::write(fx.source.join("a.bin"), vec![1u8; 3000]).unwrap();
    let rsync = fake_rsync(
        fx.tools(),
        r#"case "$*" in *--dry-run*) exit 0;; esac
echo 'docs/report.pdf'
printf '      1,000  33%%  1.00MB/s    0:00:02\r'
printf '   1.00GB  89%%  10.25MB/s  0:00:05\r'
printf '        999  33%%  1.00MB/s    0:00:02\r'
echo 'docs/photo.jpg'
printf '      2,000  66%%  2.00MB/s    0:00:01 (xfr#2, to-chk=0/2)\n'"#,
    );
    let manager = fx.manager(fx.config(rsync));

    let outcome = manager.start(None, None).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let snap = manager.progress().snapshot().await;
    assert_eq!(snap.total_bytes, Some(3000));
    // forced to the total on completion
    assert_eq!(snap.bytes_done, 3000);
    let names: Vec<_> = snap.history.iter().map(|e| e.file_name.as_str()).collect();
    assert_eq!(names, vec!["report.pdf", "photo.jpg"]);
    assert!(snap.history.iter().all(|e| !e.file_name.contains('%')));

    let records = fx.records().await;
    let copy_end = records
        .iter()
        .find(|r| r.step() == Some(StepId::CopyRun) && r.event == LogEvent::End)
        .unwrap();
    // the 1.00GB line outranks the later comma-grouped counts
    assert_eq!(copy_end.bytes_done, Some(1_000_000_000));
    assert_eq!(copy_end.speed, Some(2_000_000));
}

#[tokio::test]
async fn tool_failure_preserves_exit_code_and_stops() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "echo 'rsync: permission denied' >&2\nexit 23");
    let manager = fx.manager(fx.config(rsync));

    let outcome = manager.start(None, None).await;
    match outcome {
        RunOutcome::Failed { step, message } => {
            assert_eq!(step, StepId::CopyRun);
            assert!(message.contains("23"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(manager.control_state().await, ControlState::Stopped);
    assert_eq!(manager.step_status(StepId::PostVerify).await, StepStatus::Waiting);

    let records = fx.records().await;
    assert_well_formed(&records);
    let last = records.last().unwrap();
    assert_eq!(last.step(), Some(StepId::CopyRun));
    assert_eq!(last.status, Some(RecordStatus::Error));
    assert_eq!(last.exit_code, Some(23));
}

#[tokio::test]
async fn vanished_files_code_counts_as_success() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exit 24");
    let manager = fx.manager(fx.config(rsync));
    assert_eq!(manager.start(None, None).await, RunOutcome::Completed);
}

#[tokio::test]
async fn stop_during_copy_terminates_tool() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exec sleep 30");
    let manager = fx.manager(fx.config(rsync));

    let run = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(None, None).await }
    });

    wait_for_status(&manager, StepId::CopyRun, StepStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.stop().await;

    let outcome = timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not stop")
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            step: StepId::CopyRun,
            ..
        }
    ));
    assert_eq!(manager.control_state().await, ControlState::Stopped);
    assert_eq!(manager.step_status(StepId::CopyRun).await, StepStatus::Error);
    assert_eq!(manager.step_status(StepId::PostVerify).await, StepStatus::Waiting);
    assert_eq!(manager.step_status(StepId::Finalize).await, StepStatus::Waiting);

    let records = fx.records().await;
    assert_well_formed(&records);
    assert!(!records.iter().any(|r| r.step() == Some(StepId::PostVerify)));
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exec sleep 30");
    let manager = fx.manager(fx.config(rsync));

    let run = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(None, None).await }
    });
    wait_for_status(&manager, StepId::CopyRun, StepStatus::Running).await;

    let original = manager.config().await.job_id;
    let second = manager
        .start(Some(fx.source.clone()), Some(fx.temp.path().join("elsewhere")))
        .await;
    assert_eq!(second, RunOutcome::Rejected);
    assert_eq!(manager.config().await.job_id, original);

    manager.stop().await;
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn pause_lets_current_step_finish() {
    let fx = Fixture::new();
    let rsync = fake_rsync(
        fx.tools(),
        r#"case "$*" in *--dry-run*) exit 0;; esac
sleep 0.5"#,
    );
    let manager = fx.manager(fx.config(rsync));

    let run = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(None, None).await }
    });
    wait_for_status(&manager, StepId::CopyRun, StepStatus::Running).await;
    assert!(manager.pause().await);

    let outcome = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Halted(ControlState::Paused));
    assert_eq!(manager.step_status(StepId::CopyRun).await, StepStatus::Ok);
    assert_eq!(manager.step_status(StepId::PostVerify).await, StepStatus::Waiting);

    // Paused runs may be started again; the default policy restarts from the top.
    let job_id = manager.config().await.job_id.to_string();
    assert_eq!(manager.start(None, None).await, RunOutcome::Completed);
    let records = fx.records().await;
    let started = started_steps(&records, &job_id);
    assert_eq!(started.iter().filter(|s| *s == "validate_paths").count(), 2);
}

#[tokio::test]
async fn paused_run_blocks_start_until_its_step_returns() {
    let fx = Fixture::new();
    let rsync = fake_rsync(
        fx.tools(),
        r#"case "$*" in *--dry-run*) exit 0;; esac
sleep 0.6"#,
    );
    let manager = fx.manager(fx.config(rsync));
    let job_id = manager.config().await.job_id.to_string();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(None, None).await }
    });
    wait_for_status(&manager, StepId::CopyRun, StepStatus::Running).await;
    assert!(manager.pause().await);

    // copy_run of the paused run is still executing
    assert!(manager.is_busy());
    assert_eq!(manager.start(None, None).await, RunOutcome::Rejected);

    let outcome = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Halted(ControlState::Paused));
    assert!(!manager.is_busy());

    assert_eq!(manager.start(None, None).await, RunOutcome::Completed);
    assert_eq!(manager.control_state().await, ControlState::Idle);

    let records = fx.records().await;
    assert_well_formed(&records);
    let expected: Vec<&str> = StepId::TRANSFER[..5]
        .iter()
        .chain(StepId::TRANSFER.iter())
        .map(|s| s.as_str())
        .collect();
    assert_eq!(started_steps(&records, &job_id), expected);
}

#[tokio::test]
async fn stopped_run_blocks_start_until_tool_exits() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exec sleep 30");
    let manager = fx.manager(fx.config(rsync));

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(None, None).await }
    });
    wait_for_status(&manager, StepId::CopyRun, StepStatus::Running).await;
    manager.stop().await;
    let second = manager.start(None, None).await;

    let outcome = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            step: StepId::CopyRun,
            ..
        }
    ));
    assert_eq!(second, RunOutcome::Rejected);
    assert!(!manager.is_busy());
    assert_eq!(manager.control_state().await, ControlState::Stopped);
}

#[tokio::test]
async fn new_paths_issue_new_job_id() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exit 0");
    let manager = fx.manager(fx.config(rsync));

    let first = manager.config().await.job_id;
    manager.start(None, None).await;
    assert_eq!(manager.config().await.job_id, first);

    let other = fx.temp.path().join("other");
    manager
        .start(Some(fx.source.clone()), Some(other.clone()))
        .await;
    let config = manager.config().await;
    assert_ne!(config.job_id, first);
    assert_eq!(config.destination, other);
}

#[tokio::test]
async fn resume_policy_skips_completed_steps() {
    let fx = Fixture::new();
    let marker = fx.tools().join("fail_verify");
    std::fs::write(&marker, b"").unwrap();
    let rsync = fake_rsync(
        fx.tools(),
        &format!(
            r#"case "$*" in *--dry-run*) [ -e '{}' ] && exit 23;; esac
exit 0"#,
            marker.display()
        ),
    );
    let config = AppConfig {
        run_policy: RunPolicy::ResumeFromLog,
        ..fx.config(rsync)
    };
    let manager = fx.manager(config);
    let job_id = manager.config().await.job_id;

    let outcome = manager.start(None, None).await;
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            step: StepId::PostVerify,
            ..
        }
    ));
    assert_eq!(manager.resume_point().await.unwrap(), Some(StepId::CopyRun));

    std::fs::remove_file(&marker).unwrap();
    assert_eq!(manager.start(None, None).await, RunOutcome::Completed);
    assert_eq!(manager.config().await.job_id, job_id);

    let statuses = manager.step_statuses().await;
    assert!(statuses.iter().all(|(_, s)| *s == StepStatus::Ok));

    // copy ran once; verify ran twice
    let invoked = calls(fx.tools());
    assert_eq!(invoked.iter().filter(|c| !c.contains("--dry-run")).count(), 1);
    assert_eq!(invoked.iter().filter(|c| c.contains("--dry-run")).count(), 2);

    let records = fx.records().await;
    assert_well_formed(&records);
    let started = started_steps(&records, &job_id.to_string());
    assert_eq!(started.iter().filter(|s| *s == "copy_run").count(), 1);
    assert_eq!(started.iter().filter(|s| *s == "post_verify").count(), 2);
    assert_eq!(manager.resume_point().await.unwrap(), Some(StepId::Finalize));
}

#[tokio::test]
async fn nested_destination_is_rejected() {
    let fx = Fixture::new();
    let rsync = fake_rsync(fx.tools(), "exit 0");
    let manager = fx.manager(fx.config(rsync));

    let outcome = manager
        .start(Some(fx.source.clone()), Some(fx.source.join("sub")))
        .await;
    match outcome {
        RunOutcome::Failed { step, message } => {
            assert_eq!(step, StepId::ValidatePaths);
            assert!(message.contains("nested"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(calls(fx.tools()).is_empty());
    assert!(!fx.source.join("sub").exists());
}

#[tokio::test]
async fn erase_removes_target() {
    let fx = Fixture::new();
    let target = fx.temp.path().join("wipe");
    std::fs::create_dir_all(target.join("nested")).unwrap();
    std::fs::write(target.join("nested/file.txt"), b"secret").unwrap();

    let hook = Arc::new(CountingHook::default());
    let manager = fx
        .manager(AppConfig {
            log_file: fx.log_file.clone(),
            ..AppConfig::default()
        })
        .with_completion_hook(hook.clone());

    let outcome = manager.start_erase(target.clone()).await;
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!target.exists());
    assert_eq!(hook.calls.load(Ordering::SeqCst), 0);

    let statuses = manager.step_statuses().await;
    assert_eq!(
        statuses,
        vec![
            (StepId::Confirm, StepStatus::Ok),
            (StepId::DeleteRun, StepStatus::Ok)
        ]
    );

    let records = fx.records().await;
    assert_well_formed(&records);
    let steps: Vec<_> = records.iter().filter_map(|r| r.step()).collect();
    assert_eq!(
        steps,
        vec![
            StepId::Confirm,
            StepId::Confirm,
            StepId::DeleteRun,
            StepId::DeleteRun
        ]
    );
}

#[tokio::test]
async fn erase_of_missing_target_fails_confirm() {
    let fx = Fixture::new();
    let manager = fx.manager(AppConfig {
        log_file: fx.log_file.clone(),
        ..AppConfig::default()
    });

    let outcome = manager.start_erase(fx.temp.path().join("gone")).await;
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            step: StepId::Confirm,
            ..
        }
    ));
    assert_eq!(manager.control_state().await, ControlState::Stopped);
}
