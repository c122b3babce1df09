use super::{worker::batch_snapshot, ExecutorError, WorkerTask};
use crate::{
    catalog::FilterPatterns,
    config::Config,
    engine::BatchSummary,
    ledger::{Ledger, LedgerSettings},
};
use std::{
    env,
    process::{Child, Command},
};
use tracing::{debug, error, info, instrument, warn};

/// Pool of worker processes on this machine
#[derive(Clone, Debug)]
pub struct LocalPool {
    workers: usize,
    patterns: FilterPatterns,
    log_level: String,
}

/// number of workers for `num_workers`, -1 uses every logical core
pub fn resolve_workers(num_workers: i64) -> usize {
    match usize::try_from(num_workers) {
        Ok(workers) if workers > 0 => workers,
        _ => num_cpus::get(),
    }
}

/// never more workers than runs, but at least one
pub fn pool_size(workers: usize, runnable: usize) -> usize {
    workers.min(runnable).max(1)
}

impl LocalPool {
    pub fn load(config: &Config, patterns: FilterPatterns, log_level: &str) -> Self {
        Self {
            workers: resolve_workers(config.parallel.num_workers),
            patterns,
            log_level: log_level.to_owned(),
        }
    }

    /// command line of worker `index` of `count`
    pub fn worker_arguments(&self, config: &Config, index: usize, count: usize) -> Result<Vec<String>, ExecutorError> {
        let source = config.source.as_ref().ok_or(ExecutorError::ConfigSource)?;

        let mut arguments = vec![
            "--config".to_owned(),
            source.to_string_lossy().into_owned(),
            "--log-level".to_owned(),
            self.log_level.clone(),
            "worker".to_owned(),
            "--index".to_owned(),
            index.to_string(),
            "--count".to_owned(),
            count.to_string(),
        ];
        arguments.extend(self.patterns.to_args());

        Ok(arguments)
    }

    /// partition the frozen snapshot over child processes and wait for all of them
    #[instrument(skip_all, level = "info")]
    pub fn execute(&self, config: &Config) -> Result<BatchSummary, ExecutorError> {
        let filter = self.patterns.compile()?;
        let ledger = Ledger::open(&config.ledger_path(), LedgerSettings::from_config(config))?;
        let snapshot = batch_snapshot(config, &ledger)?;
        let runnable = snapshot
            .runnable(&filter)
            .into_iter()
            .map(|record| record.spec.run_id.clone())
            .collect::<Vec<_>>();

        let count = pool_size(self.workers, runnable.len());
        info!(runnable = runnable.len(), workers = count, "Starting local pool");

        if runnable.is_empty() {
            info!("Nothing to run");
            return Ok(BatchSummary::default());
        }

        if count == 1 {
            return WorkerTask::new(1, 1, self.patterns.clone()).execute(config);
        }

        let executable = env::current_exe().map_err(ExecutorError::CurrentExe)?;
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(count);

        for index in 1..=count {
            let arguments = self.worker_arguments(config, index, count)?;
            debug!(index, arguments = ?arguments, "Spawning worker");

            match Command::new(&executable).args(&arguments).spawn() {
                Ok(child) => children.push((index, child)),
                Err(source) => {
                    // the ones already running still finish their blocks
                    for (running, mut child) in children {
                        if let Err(error) = child.wait() {
                            error!(index = running, error = ?error, "Failed to wait for worker");
                        }
                    }
                    return Err(ExecutorError::Spawn { index, source });
                }
            }
        }

        let mut failed = Vec::new();
        for (index, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => debug!(index, "Worker finished"),
                Ok(status) => {
                    error!(index, status = %status, "Worker failed");
                    failed.push(index);
                }
                Err(error) => {
                    error!(index, error = ?error, "Failed to wait for worker");
                    failed.push(index);
                }
            }
        }

        // the children report to the ledger, read their outcomes back from it
        let mut summary = BatchSummary::default();
        for run_id in runnable.iter() {
            match ledger.get(run_id)? {
                Some(record) => summary.record(record.status),
                None => warn!(run_id = %run_id, "Run vanished from the ledger"),
            }
        }
        info!(%summary, "Local pool finished");

        if failed.is_empty() {
            Ok(summary)
        } else {
            Err(ExecutorError::WorkersFailed(failed))
        }
    }
}
