use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use lyracopy::config::AppConfig;
use lyracopy::context::AppContext;
use lyracopy::core::{
    JobConfig, JobId, JobManager, OpenDestination, RunOutcome, RunPolicy, event_log,
};
use lyracopy::logging::{self, LogConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lyracopy")]
#[command(about = "Resumable rsync-driven transfer and erase", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./lyracopy.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy SOURCE into DESTINATION
    Transfer {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        destination: PathBuf,
        /// Open the destination in the file browser when done
        #[arg(long)]
        open: bool,
    },
    /// Recursively delete TARGET
    Erase { target: PathBuf },
    /// Print the last completed step recorded for a job
    ResumePoint { job_id: String },
    /// Print event log records
    Log {
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    rsync_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, value_enum)]
    run_policy: Option<RunPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    dry_run_preview: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Transfer {
            source,
            destination,
            open,
        } => run_transfer(config, source, destination, open)
            .await
            .context("Transfer failed"),
        Commands::Erase { target } => run_erase(config, target).await.context("Erase failed"),
        Commands::ResumePoint { job_id } => print_resume_point(&config, &job_id).await,
        Commands::Log { job_id } => print_log(&config, job_id.as_deref()).await,
        Commands::ShowConfig => {
            let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{content}");
            Ok(())
        }
    }
}

fn build_manager(config: AppConfig, source: PathBuf, destination: PathBuf) -> JobManager {
    let log_file = config.log_file.clone();
    let ctx = AppContext::new(config);
    JobManager::new(ctx, JobConfig::new(source, destination, log_file))
}

async fn run_transfer(
    config: AppConfig,
    source: PathBuf,
    destination: PathBuf,
    open: bool,
) -> Result<()> {
    let mut manager = build_manager(config, source.clone(), destination.clone());
    if open {
        manager = manager.with_completion_hook(Arc::new(OpenDestination));
    }

    let outcome = drive(&manager, {
        let manager = manager.clone();
        async move { manager.start(Some(source), Some(destination)).await }
    })
    .await?;

    let snap = manager.progress().snapshot().await;
    println!(
        "job {}: {} bytes copied",
        manager.config().await.job_id,
        snap.bytes_done
    );
    report(outcome)
}

async fn run_erase(config: AppConfig, target: PathBuf) -> Result<()> {
    let manager = build_manager(config, PathBuf::new(), PathBuf::new());
    let outcome = drive(&manager, {
        let manager = manager.clone();
        async move { manager.start_erase(target).await }
    })
    .await?;
    println!("job {}", manager.config().await.job_id);
    report(outcome)
}

/// Run a job while printing progress, stopping it on Ctrl-C.
async fn drive(
    manager: &JobManager,
    run: impl std::future::Future<Output = RunOutcome> + Send + 'static,
) -> Result<RunOutcome> {
    let mut task = tokio::spawn(run);
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut interrupted = false;

    loop {
        tokio::select! {
            joined = &mut task => return joined.context("Job task panicked"),
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Stopping...");
                manager.stop().await;
            }
            _ = ticker.tick() => {
                let snap = manager.progress().snapshot().await;
                match snap.percentage() {
                    Some(pct) => eprintln!(
                        "{:>5.1}%  {} / {} bytes  {}",
                        pct,
                        snap.bytes_done,
                        snap.total_bytes.unwrap_or_default(),
                        snap.current_file.unwrap_or_default()
                    ),
                    None => eprintln!(
                        "{} bytes  {}",
                        snap.bytes_done,
                        snap.current_file.unwrap_or_default()
                    ),
                }
            }
        }
    }
}

fn report(outcome: RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed => {
            println!("completed");
            Ok(())
        }
        RunOutcome::Failed { step, message } => bail!("step {step} failed: {message}"),
        RunOutcome::Halted(state) => bail!("run halted ({state:?})"),
        RunOutcome::Rejected => bail!("a run is already in progress"),
    }
}

async fn print_resume_point(config: &AppConfig, job_id: &str) -> Result<()> {
    let Some(job_id) = JobId::parse(job_id) else {
        bail!("Invalid job id: {job_id}");
    };
    let records = event_log::read_records(&config.log_file)
        .await
        .with_context(|| format!("Failed to read {}", config.log_file.display()))?;

    match event_log::resume_point(&records, job_id) {
        Some(step) => println!("{step}"),
        None => println!("none"),
    }
    Ok(())
}

async fn print_log(config: &AppConfig, job_id: Option<&str>) -> Result<()> {
    let records = event_log::read_records(&config.log_file)
        .await
        .with_context(|| format!("Failed to read {}", config.log_file.display()))?;

    for record in records
        .iter()
        .filter(|r| job_id.is_none_or(|id| r.job_id == id))
    {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}
