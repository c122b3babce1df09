use clap::{Parser, Subcommand};
use cropsim_runner::{
    batch::{self, BatchError},
    catalog::{FilterPatterns, RunId},
    config::Config,
    executors::{ExecutorError, WorkerTask},
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Batch runner for multi-model crop simulations
#[derive(Parser, Debug)]
#[command(name = "cropsim", author, version, about)]
struct Cli {
    /// Path to the batch configuration
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed the ledger, promote runs with inputs and freeze the batch snapshot
    Prepare {
        #[command(flatten)]
        filters: FilterPatterns,
    },
    /// Prepare and execute the batch on the local pool or as an array task
    Run {
        #[command(flatten)]
        filters: FilterPatterns,
    },
    /// Show run counts per status
    Status {
        /// List FAILED, ERROR and EXHAUSTED runs with their last error
        #[arg(long)]
        failed: bool,
    },
    /// Requeue FAILED and ERROR runs
    Retry {
        /// Only requeue these runs
        run_ids: Vec<String>,
    },
    /// Process one block of the frozen snapshot
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        index: usize,
        #[arg(long)]
        count: usize,
        #[command(flatten)]
        filters: FilterPatterns,
    },
}

fn exit_code(error: &BatchError) -> ExitCode {
    match error {
        BatchError::Config(_) | BatchError::Executor(ExecutorError::Config(_)) => ExitCode::from(2),
        BatchError::Ledger(_) | BatchError::Executor(ExecutorError::Ledger(_)) => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    }
}

fn execute(cli: Cli, config: Config) -> Result<(), BatchError> {
    match cli.command {
        Commands::Prepare { filters } => {
            let report = batch::prepare(&config, &filters)?;
            println!(
                "{} runs in catalog, {} new, {} recovered, {} requeued, {} exhausted, {} missing inputs, {} ready",
                report.catalog,
                report.seeded.inserted,
                report.recovered.len(),
                report.retries.requeued.len(),
                report.retries.exhausted.len(),
                report.missing_inputs.len(),
                report.runnable
            );
        }
        Commands::Run { filters } => {
            let summary = batch::run_batch(&config, &filters, &cli.log_level)?;
            println!("{summary}");
        }
        Commands::Status { failed } => {
            let (summary, records) = batch::status(&config, failed)?;
            println!("{summary}");

            for record in records.iter() {
                let error = record
                    .last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                println!(
                    "{} {} attempts={} {error}",
                    record.run_id(),
                    record.status,
                    record.attempts
                );
            }
        }
        Commands::Retry { run_ids } => {
            let run_ids = run_ids.into_iter().map(RunId::from).collect::<Vec<_>>();
            let report = batch::retry(&config, &run_ids)?;
            println!(
                "{} requeued, {} exhausted, {} ignored",
                report.requeued.len(),
                report.exhausted.len(),
                report.ignored.len()
            );
        }
        Commands::Worker {
            index,
            count,
            filters,
        } => {
            let summary = WorkerTask::new(index, count, filters)
                .execute(&config)
                .map_err(BatchError::from)?;
            info!(%summary, "Worker finished");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(config = ?cli.config, "Failed to load configuration: {error}");
            return ExitCode::from(2);
        }
    };

    match execute(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "{error}");
            exit_code(&error)
        }
    }
}
