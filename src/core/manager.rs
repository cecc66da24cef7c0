//! Job control and the step pipeline.
//!
//! All control state lives behind one async mutex that is never held across a
//! step body, so `pause`/`stop` can interleave with a running pipeline while
//! transitions themselves are never observed half-done. Steps run strictly in
//! order; the first failure stops the run. At most one pipeline is in flight:
//! a paused or stopped run still owns the manager until its current step has
//! returned.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::event_log::{EventLog, LogRecord};
use crate::core::hooks::{CompletionHook, LogCompletion};
use crate::core::models::{
    ControlState, JobConfig, JobId, Mode, RunOutcome, RunPolicy, StepId, StepStatus,
};
use crate::core::parser::{LineParser, RsyncLineParser};
use crate::core::progress::ProgressTracker;
use crate::core::runner::ProcessRunner;
use crate::core::steps::{self, PlanStep, RsyncPlan, SkipPlan, StepContext};
use crate::error::{JobError, Result};

struct ManagerState {
    control: ControlState,
    job: JobConfig,
    statuses: BTreeMap<StepId, StepStatus>,
    /// Runner of the current run; replaced on every start.
    runner: Option<ProcessRunner>,
}

/// Owns one job's configuration and drives its steps.
#[derive(Clone)]
pub struct JobManager {
    ctx: AppContext,
    events: EventLog,
    state: Arc<Mutex<ManagerState>>,
    /// Set while a pipeline is executing, including after pause/stop until
    /// its loop returns.
    active: Arc<AtomicBool>,
    plan: Arc<dyn PlanStep>,
    parser: Arc<dyn LineParser>,
    hook: Arc<dyn CompletionHook>,
}

/// Clears the in-flight flag when the run finishes or its future is dropped.
struct ActiveRun(Arc<AtomicBool>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum RunRequest {
    Transfer {
        source: Option<PathBuf>,
        destination: Option<PathBuf>,
    },
    Erase(PathBuf),
}

impl JobManager {
    /// Build a manager for `job`. Opens the job's event log, so this must be
    /// called from within a Tokio runtime.
    pub fn new(ctx: AppContext, job: JobConfig) -> Self {
        let events = EventLog::open(job.log_file.clone());
        let plan: Arc<dyn PlanStep> = if ctx.config.dry_run_preview {
            Arc::new(RsyncPlan)
        } else {
            Arc::new(SkipPlan)
        };

        Self {
            ctx,
            events,
            state: Arc::new(Mutex::new(ManagerState {
                control: ControlState::Idle,
                job,
                statuses: all_waiting(),
                runner: None,
            })),
            active: Arc::new(AtomicBool::new(false)),
            plan,
            parser: Arc::new(RsyncLineParser),
            hook: Arc::new(LogCompletion),
        }
    }

    pub fn with_plan_step(mut self, plan: Arc<dyn PlanStep>) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn LineParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_completion_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn control_state(&self) -> ControlState {
        self.state.lock().await.control
    }

    pub async fn config(&self) -> JobConfig {
        self.state.lock().await.job.clone()
    }

    /// Statuses of the current mode's steps, in pipeline order.
    pub async fn step_statuses(&self) -> Vec<(StepId, StepStatus)> {
        let state = self.state.lock().await;
        StepId::sequence(state.job.mode)
            .iter()
            .map(|step| (*step, state.statuses[step]))
            .collect()
    }

    pub async fn step_status(&self, step: StepId) -> StepStatus {
        self.state.lock().await.statuses[&step]
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.ctx.progress
    }

    /// Whether a pipeline is still executing, even if pause or stop was requested.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Last step the event log records as completed for the current job.
    pub async fn resume_point(&self) -> Result<Option<StepId>> {
        let job_id = self.state.lock().await.job.job_id;
        self.events.resume_point(job_id).await
    }

    /// Start a transfer run.
    ///
    /// With both paths given the job is reconfigured under a new id; otherwise
    /// the current configuration is reused. Returns `Rejected` while a run is
    /// in flight.
    pub async fn start(
        &self,
        source: Option<PathBuf>,
        destination: Option<PathBuf>,
    ) -> RunOutcome {
        self.launch(RunRequest::Transfer {
            source,
            destination,
        })
        .await
    }

    /// Start an erase run for `target` under a new job id.
    pub async fn start_erase(&self, target: PathBuf) -> RunOutcome {
        self.launch(RunRequest::Erase(target)).await
    }

    /// Let the current step finish, then halt before the next one.
    pub async fn pause(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.control != ControlState::Running {
            return false;
        }
        state.control = ControlState::Paused;
        info!(job_id = %state.job.job_id, "Pause requested");
        true
    }

    /// Halt the run and terminate any in-flight tool.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.control = ControlState::Stopped;
        if let Some(runner) = &state.runner {
            runner.cancel();
        }
        info!(job_id = %state.job.job_id, "Stop requested");
    }

    async fn launch(&self, request: RunRequest) -> RunOutcome {
        let Some((job, runner, reissued, _active)) = self.begin(request).await else {
            return RunOutcome::Rejected;
        };

        self.ctx.progress.reset().await;

        let steps = StepId::sequence(job.mode);
        let first = if reissued {
            0
        } else {
            self.first_step_index(&job, steps).await
        };

        let span = info_span!("job", job_id = %job.job_id, mode = ?job.mode);
        let outcome = self
            .run_steps(&job, &runner, &steps[first..])
            .instrument(span)
            .await;

        // Records of a finished run are on disk once start returns.
        self.events.flush().await;
        outcome
    }

    /// Gate on control state and apply the new configuration atomically.
    async fn begin(
        &self,
        request: RunRequest,
    ) -> Option<(JobConfig, ProcessRunner, bool, ActiveRun)> {
        let mut state = self.state.lock().await;
        if !state.control.accepts_start() || self.is_busy() {
            debug!(control = ?state.control, busy = self.is_busy(), "Start rejected");
            return None;
        }
        // Claimed under the state lock, so two starts cannot both pass.
        self.active.store(true, Ordering::Release);
        let active = ActiveRun(self.active.clone());

        let reissued = match request {
            RunRequest::Transfer {
                source: Some(source),
                destination: Some(destination),
            } => {
                state.job.source = source;
                state.job.destination = destination;
                state.job.mode = Mode::Transfer;
                true
            }
            RunRequest::Transfer { .. } => {
                let switching = state.job.mode != Mode::Transfer;
                state.job.mode = Mode::Transfer;
                switching
            }
            RunRequest::Erase(target) => {
                state.job.erase_target = Some(target);
                state.job.mode = Mode::Erase;
                true
            }
        };
        if reissued {
            state.job.job_id = JobId::new();
        }

        let runner = ProcessRunner::new(self.ctx.config.stop_grace());
        state.control = ControlState::Running;
        state.statuses = all_waiting();
        state.runner = Some(runner.clone());

        info!(job_id = %state.job.job_id, mode = ?state.job.mode, "Run started");
        Some((state.job.clone(), runner, reissued, active))
    }

    /// Index to begin at under the configured run policy.
    async fn first_step_index(&self, job: &JobConfig, steps: &[StepId]) -> usize {
        if self.ctx.config.run_policy == RunPolicy::Restart {
            return 0;
        }

        let last_ok = match self.events.resume_point(job.job_id).await {
            Ok(point) => point,
            Err(e) => {
                debug!(error = %e, "No readable event log, starting from the first step");
                None
            }
        };
        let Some(index) = last_ok.and_then(|step| steps.iter().position(|s| *s == step)) else {
            return 0;
        };

        let mut state = self.state.lock().await;
        for step in &steps[..=index] {
            state.statuses.insert(*step, StepStatus::Ok);
        }
        info!(resume_after = %steps[index], "Resuming from event log");
        index + 1
    }

    async fn run_steps(
        &self,
        job: &JobConfig,
        runner: &ProcessRunner,
        steps: &[StepId],
    ) -> RunOutcome {
        for &step in steps {
            {
                let mut state = self.state.lock().await;
                if state.control != ControlState::Running {
                    info!(control = ?state.control, next_step = %step, "Run halted");
                    return RunOutcome::Halted(state.control);
                }
                state.statuses.insert(step, StepStatus::Running);
            }

            self.events.append(LogRecord::start(job.job_id, step));
            info!(step = %step, "Step started");

            match self.run_step(step, job, runner).await {
                Ok(()) => {
                    let mut record = LogRecord::end_ok(job.job_id, step);
                    if step == StepId::CopyRun {
                        let snap = self.ctx.progress.snapshot().await;
                        record = record.with_transfer(snap.bytes_done, snap.speed_bps);
                    }
                    self.events.append(record);
                    self.set_status(step, StepStatus::Ok).await;
                    info!(step = %step, "Step finished");
                }
                Err(e) => {
                    let message = e.to_string();
                    self.events.append(LogRecord::end_error(
                        job.job_id,
                        step,
                        e.exit_code(),
                        message.clone(),
                    ));
                    self.ctx.progress.set_error(message.clone()).await;
                    {
                        let mut state = self.state.lock().await;
                        state.statuses.insert(step, StepStatus::Error);
                        state.control = ControlState::Stopped;
                    }

                    if e.is_cancelled() {
                        warn!(step = %step, "Step cancelled");
                    } else {
                        error!(
                            step = %step,
                            exit_code = e.exit_code(),
                            error = %message,
                            "Step failed"
                        );
                    }
                    return RunOutcome::Failed { step, message };
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            if state.control != ControlState::Running {
                return RunOutcome::Halted(state.control);
            }
            state.control = ControlState::Idle;
        }

        self.ctx.progress.complete().await;
        if job.mode == Mode::Transfer {
            self.hook.transfer_completed(job).await;
        }
        info!("Run completed");
        RunOutcome::Completed
    }

    async fn run_step(&self, step: StepId, job: &JobConfig, runner: &ProcessRunner) -> Result<()> {
        let ctx = StepContext {
            job,
            config: &self.ctx.config,
            progress: &self.ctx.progress,
            runner,
            parser: self.parser.as_ref(),
        };

        match step {
            StepId::ValidatePaths => steps::validate_paths(&job.source, &job.destination),
            StepId::CheckSpace => steps::check_space(&ctx).await,
            StepId::PrepareDest => steps::prepare_dest(&job.destination).await,
            StepId::PlanDryrun => self.plan.plan(&ctx).await,
            StepId::CopyRun => steps::copy_run(&ctx).await,
            StepId::PostVerify => steps::post_verify(&ctx).await,
            StepId::Finalize => steps::finalize(&ctx).await,
            StepId::Confirm => steps::confirm(erase_target(job)?),
            StepId::DeleteRun => steps::delete_run(&ctx, erase_target(job)?).await,
        }
    }

    async fn set_status(&self, step: StepId, status: StepStatus) {
        self.state.lock().await.statuses.insert(step, status);
    }
}

fn erase_target(job: &JobConfig) -> Result<&Path> {
    job.erase_target
        .as_deref()
        .ok_or_else(|| JobError::EraseTargetNotFound(PathBuf::new()))
}

fn all_waiting() -> BTreeMap<StepId, StepStatus> {
    StepId::TRANSFER
        .iter()
        .chain(StepId::ERASE.iter())
        .map(|step| (*step, StepStatus::Waiting))
        .collect()
}
