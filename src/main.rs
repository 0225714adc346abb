//! `datacloud` admin CLI: inspect and abort Data Cloud ingest jobs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use datacloud_client::{AppError, Config, DataCloudClient, JobState, ListJobsParams};

#[derive(Parser)]
#[command(name = "datacloud", version, about = "Salesforce Data Cloud job administration")]
struct Cli {
    /// Operation to run
    #[arg(long, value_enum, default_value_t = Command::ListActiveJobs)]
    command: Command,

    /// Job id for job_info and abort_job
    #[arg(long, alias = "job_id")]
    job_id: Option<String>,

    /// YAML config file. DATACLOUD_* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// File receiving DEBUG-level logs
    #[arg(long, default_value = "debug.log")]
    log_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Command {
    /// Jobs in Open, UploadComplete or InProgress
    ListActiveJobs,
    /// First page of all jobs
    ListAllJobs,
    /// Details of the job given by --job-id
    JobInfo,
    /// Abort the job given by --job-id
    AbortJob,
    /// Abort every Open or UploadComplete job
    AbortAllJobs,
}

/// Console logging honors `RUST_LOG` (default `info`); the log file always
/// receives this crate's DEBUG output.
fn init_logging(log_file: &Path) -> Result<WorkerGuard, AppError> {
    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| AppError::Config(format!("Invalid log file: {}", log_file.display())))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_filter = EnvFilter::new("info,datacloud_client=debug,datacloud=debug");

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(console_filter))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(file_filter),
        )
        .try_init()
        .map_err(|e| AppError::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}

fn log_pretty<T: Serialize>(value: &T) -> Result<(), AppError> {
    let pretty = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Internal(format!("Failed to render result: {}", e)))?;
    info!("{}", pretty);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;
    let mut client = DataCloudClient::new(config)?;

    match cli.command {
        Command::ListActiveJobs => {
            let params = ListJobsParams::with_states([
                JobState::Open,
                JobState::UploadComplete,
                JobState::InProgress,
            ]);
            log_pretty(&client.list_jobs(&params).await?)
        }
        Command::ListAllJobs => log_pretty(&client.list_jobs(&ListJobsParams::default()).await?),
        Command::JobInfo => match cli.job_id.as_deref() {
            Some(job_id) => log_pretty(&client.job_info(job_id).await?),
            None => {
                error!("--job-id is required for job_info");
                Ok(())
            }
        },
        Command::AbortJob => match cli.job_id.as_deref() {
            Some(job_id) => log_pretty(&client.abort_job(job_id).await?),
            None => {
                error!("--job-id is required for abort_job");
                Ok(())
            }
        },
        Command::AbortAllJobs => log_pretty(&client.abort_all_jobs().await?),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(&cli.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.sanitized());
            ExitCode::FAILURE
        }
    }
}
