pub mod local;
pub mod worker;

use crate::{
    catalog::FilterPatterns,
    config::{Config, ConfigErrors},
    distributed::{util::worker_from_env, PartitionError},
    engine::BatchSummary,
    ledger::LedgerError,
};
use std::io;
use thiserror::Error;
use tracing::info;

pub use local::LocalPool;
pub use worker::WorkerTask;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("Unable to locate the cropsim executable: {0}")]
    CurrentExe(io::Error),
    #[error("The configuration was not loaded from a file, workers cannot be started")]
    ConfigSource,
    #[error("Failed to start worker {index}: {source}")]
    Spawn { index: usize, source: io::Error },
    #[error("Workers {0:?} did not finish successfully")]
    WorkersFailed(Vec<usize>),
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(LocalPool),
    Worker(WorkerTask),
}

impl Executors {
    /// an array task if the scheduler environment is present, otherwise the local pool
    pub fn load(config: &Config, patterns: FilterPatterns, log_level: &str) -> Result<Self, ConfigErrors> {
        if let Some(hpc) = &config.parallel.hpc {
            if let Some((index, count)) = worker_from_env(hpc)? {
                info!(worker_index = index, worker_count = count, "Running as array task");

                return Ok(Self::Worker(WorkerTask::new(index, count, patterns)));
            }
        }

        Ok(Self::Local(LocalPool::load(config, patterns, log_level)))
    }

    /// array tasks rely on an earlier `prepare`, the local pool prepares itself
    pub fn prepares(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn execute(&self, config: &Config) -> Result<BatchSummary, ExecutorError> {
        match self {
            Self::Local(pool) => pool.execute(config),
            Self::Worker(task) => task.execute(config),
        }
    }
}
