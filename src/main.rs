use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use gridflow::batch::{
    BatchAdapter, GridEngineDriver, JobRequest, ProcessRunner, TorqueAdapter, UpdatedBatchJob,
};
use gridflow::config::{DriverConfig, TorqueConfig};
use gridflow::error::GridflowError;
use gridflow::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridflow")]
#[command(version)]
#[command(about = "Run workflow jobs on grid engine clusters")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// PBS/Torque commands
    Torque {
        #[command(flatten)]
        options: TorqueArgs,

        #[command(subcommand)]
        command: TorqueCommands,
    },
}

// =============================================================================
// Torque Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct TorqueArgs {
    /// Seconds between scheduler status queries
    #[arg(long, default_value = "1")]
    state_polling_wait: u64,

    /// Directory the scheduler writes job logs into (defaults to the temp dir)
    #[arg(long)]
    batch_logs_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TorqueCommands {
    /// Submit a command and wait for it to finish
    Submit {
        /// Number of CPUs to request
        #[arg(long, default_value = "1")]
        cpu: f64,

        /// Memory to request, in MiB
        #[arg(long, default_value = "1024")]
        memory_mb: u64,

        /// Number of GPUs to request
        #[arg(long)]
        gpus: Option<u32>,

        /// Job name shown in logs
        #[arg(long, default_value = "gridflow")]
        name: String,

        /// The command to run (e.g., "echo hello")
        command: String,
    },
    /// Print the exit code of a scheduler job
    Status {
        /// Scheduler job id (e.g., 1234.headnode)
        external_id: String,
    },
    /// Cancel a scheduler job
    Kill {
        /// Scheduler job id (e.g., 1234.headnode)
        external_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct StatusOutput {
    external_id: String,
    exit_code: Option<i32>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_submit(
    adapter: Arc<TorqueAdapter>,
    options: &TorqueArgs,
    request: JobRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config =
        DriverConfig::default().with_state_polling_wait(Duration::from_secs(options.state_polling_wait));
    if let Some(dir) = &options.batch_logs_dir {
        config = config.with_batch_logs_dir(dir.clone());
    }

    let shutdown = install_shutdown_handler()?;
    let driver = GridEngineDriver::new(adapter, config);
    driver.start()?;
    let job_id = driver.issue_batch_job(request)?;

    let update = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                driver.kill_batch_jobs(&[job_id]).await?;
                driver.shutdown().await;
                eprintln!("Job {} killed", job_id);
                std::process::exit(130);
            }
            update = driver.get_updated_batch_job(Duration::from_secs(5)) => {
                if let Some(update) = update.filter(|u| u.job_id == job_id) {
                    break update;
                }
                driver.health_check()?;
                if let Some(wall_time) = driver.running_batch_job_ids().get(&job_id) {
                    tracing::info!(job_id, wall_time, "Job running");
                }
            }
        }
    };
    driver.shutdown().await;

    print_update(&update, &options.output)?;
    if update.exit_status != 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_status(
    adapter: &TorqueAdapter,
    external_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let exit_code = adapter.get_job_exit_code(&external_id).await?;
    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                external_id,
                exit_code,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match exit_code {
            Some(code) => println!("{:<20} exited {}", external_id, code),
            None => println!("{:<20} running", external_id),
        },
    }
    Ok(())
}

fn print_update(
    update: &UpdatedBatchJob,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(update)?),
        OutputFormat::Table => {
            let wall_time = update
                .wall_time
                .map(|t| format!("{:.0}s", t))
                .unwrap_or_else(|| "-".to_string());
            println!("{:<8} {:<10} {:<6} {}", "JOB", "REASON", "EXIT", "WALL");
            println!(
                "{:<8} {:<10} {:<6} {}",
                update.job_id, update.exit_reason, update.exit_status, wall_time
            );
        }
    }
    Ok(())
}

fn mib_to_bytes(memory_mb: u64) -> Result<u64, GridflowError> {
    memory_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| GridflowError::Config(format!("--memory-mb {memory_mb} is too large")))
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Torque { options, command } => {
            let adapter =
                Arc::new(TorqueAdapter::new(Arc::new(ProcessRunner), TorqueConfig::from_env()).await);
            tracing::debug!(flavor = ?adapter.flavor(), "Using Torque adapter");

            match command {
                TorqueCommands::Submit {
                    cpu,
                    memory_mb,
                    gpus,
                    name,
                    command,
                } => {
                    let mut request = JobRequest::new(name, command)
                        .with_cpu(cpu)
                        .with_memory(mib_to_bytes(memory_mb)?);
                    if let Some(gpus) = gpus {
                        request = request.with_gpus(gpus);
                    }
                    handle_submit(adapter, &options, request).await?;
                }
                TorqueCommands::Status { external_id } => {
                    handle_status(&adapter, external_id, &options.output).await?;
                }
                TorqueCommands::Kill { external_id } => {
                    adapter.kill_job(&external_id).await?;
                    println!("Kill requested for {}", external_id);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_converts_to_bytes() {
        assert_eq!(mib_to_bytes(0).unwrap(), 0);
        assert_eq!(mib_to_bytes(1024).unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn oversized_memory_is_rejected() {
        let err = mib_to_bytes(u64::MAX / 1024).unwrap_err();
        assert!(matches!(err, GridflowError::Config(_)));
        assert!(mib_to_bytes(u64::MAX >> 20).is_ok());
        assert!(mib_to_bytes((u64::MAX >> 20) + 1).is_err());
    }
}
