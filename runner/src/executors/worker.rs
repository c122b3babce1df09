use super::ExecutorError;
use crate::{
    catalog::{FilterPatterns, RunId},
    config::Config,
    distributed::partition,
    engine::{BatchSummary, Engine},
    ledger::{Ledger, LedgerError, LedgerSettings, LedgerSnapshot, RunStatus},
};
use std::collections::HashSet;
use tracing::{info, instrument, warn};

/// One worker processing its share of the frozen batch snapshot
#[derive(Clone, Debug)]
pub struct WorkerTask {
    index: usize,
    count: usize,
    patterns: FilterPatterns,
}

impl WorkerTask {
    pub fn new(index: usize, count: usize, patterns: FilterPatterns) -> Self {
        Self {
            index,
            count,
            patterns,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    #[instrument(skip_all, level = "info", fields(worker_index = self.index))]
    pub fn execute(&self, config: &Config) -> Result<BatchSummary, ExecutorError> {
        let filter = self.patterns.compile()?;
        let ledger = Ledger::open(&config.ledger_path(), LedgerSettings::from_config(config))?;

        // array tasks start without a supervisor that recovered abandoned runs
        let recovered = ledger.reconcile_stale_running(config.execution.stale_after())?;
        if !recovered.is_empty() {
            info!(recovered = recovered.len(), "Recovered abandoned runs");
        }
        let snapshot = batch_snapshot(config, &ledger)?;

        let assignment = partition(&snapshot, &filter, self.index, self.count)?;
        info!(
            worker_count = self.count,
            assigned = assignment.run_ids.len(),
            "Received assignment"
        );

        let engine = Engine::new(config, ledger)?;

        Ok(engine.execute(&assignment, &snapshot)?)
    }
}

/// the snapshot frozen by `prepare` or `retry`, or a live one if there is none
///
/// A frozen snapshot older than the last change that made a run READY_TO_RUN would hand out
/// stale revisions, so it is replaced by a live snapshot of the same runs.
pub fn batch_snapshot(config: &Config, ledger: &Ledger) -> Result<LedgerSnapshot, LedgerError> {
    let path = config.snapshot_path();
    let live = ledger.snapshot()?;

    if !path.is_file() {
        warn!(
            path = ?path,
            "No frozen batch snapshot found, partitioning a live snapshot of the ledger"
        );

        return Ok(live);
    }

    let frozen = LedgerSnapshot::load(&path)?;
    let latest_ready = live
        .records()
        .iter()
        .filter(|record| record.status == RunStatus::ReadyToRun)
        .map(|record| record.updated_at)
        .max();

    match latest_ready {
        Some(latest) if latest > frozen.taken_at() => {
            warn!(
                path = ?path,
                frozen_at = %frozen.taken_at(),
                latest_ready = %latest,
                "Frozen batch snapshot predates the ledger, partitioning a live snapshot of its runs"
            );

            let run_ids: HashSet<&RunId> = frozen.records().iter().map(|record| record.run_id()).collect();
            Ok(live.narrowed(&run_ids))
        }
        _ => Ok(frozen),
    }
}
