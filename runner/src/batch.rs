use crate::{
    adapters::AdapterRegistry,
    catalog::{Catalog, FilterPatterns, RunId},
    config::{Config, ConfigErrors},
    engine::BatchSummary,
    executors::{ExecutorError, Executors},
    ledger::{
        Ledger, LedgerError, LedgerSettings, LedgerSnapshot, RetryReport, RunRecord, RunStatus,
        SeedReport, StatusSummary,
    },
};
use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// What `prepare` did to the ledger
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub catalog: usize,
    pub seeded: SeedReport,
    pub recovered: Vec<RunId>,
    pub retries: RetryReport,
    pub promoted: usize,
    // PENDING runs whose climate series does not exist yet
    pub missing_inputs: Vec<RunId>,
    pub runnable: usize,
}

fn open_ledger(config: &Config) -> Result<Ledger, LedgerError> {
    Ledger::open(&config.ledger_path(), LedgerSettings::from_config(config))
}

/// seed the catalog, recover and requeue runs, promote runs with inputs and freeze the
/// batch snapshot
#[instrument(skip_all, level = "info")]
pub fn prepare(config: &Config, patterns: &FilterPatterns) -> Result<PrepareReport, BatchError> {
    let registry = AdapterRegistry::load(config)?;
    let filter = patterns.compile()?;
    let catalog = Catalog::build(config, &registry, &filter)?;
    let ledger = open_ledger(config)?;

    let seeded = ledger.seed(catalog.specs())?;
    let recovered = ledger.reconcile_stale_running(config.execution.stale_after())?;

    // failures outside the selection are left for the batch that selects them
    let in_catalog: HashSet<&RunId> = catalog.specs().iter().map(|spec| &spec.run_id).collect();
    let retryable = ledger
        .snapshot()?
        .records()
        .iter()
        .filter(|record| record.status.is_retryable() && in_catalog.contains(record.run_id()))
        .map(|record| record.run_id().clone())
        .collect::<Vec<_>>();
    let retries = ledger.dispatch_retries(Some(&retryable))?;

    let pending = ledger
        .snapshot()?
        .records()
        .iter()
        .filter(|record| record.status == RunStatus::Pending && in_catalog.contains(record.run_id()))
        .map(|record| record.spec.clone())
        .collect::<Vec<_>>();

    // climate series may sit on a slow shared filesystem
    let (ready, missing): (Vec<_>, Vec<_>) = pending.par_iter().partition_map(|spec| {
        let file = config.climate_file(
            &spec.location_id,
            &spec.climate_source,
            &spec.climate_model(),
            &spec.scenario,
            &spec.period,
        );

        if file.is_file() {
            rayon::iter::Either::Left(spec.run_id.clone())
        } else {
            warn!(run_id = %spec.run_id, file = ?file, "Climate series missing, run stays PENDING");
            rayon::iter::Either::Right(spec.run_id.clone())
        }
    });
    let promoted = ledger.promote_ready(&ready)?;

    let snapshot = ledger.snapshot()?.narrowed(&in_catalog);
    let runnable = snapshot.runnable(&filter).len();
    snapshot
        .save(&config.snapshot_path())
        .map_err(LedgerError::from)?;

    let report = PrepareReport {
        catalog: catalog.len(),
        seeded,
        recovered,
        retries,
        promoted,
        missing_inputs: missing,
        runnable,
    };

    info!(
        catalog = report.catalog,
        inserted = report.seeded.inserted,
        recovered = report.recovered.len(),
        requeued = report.retries.requeued.len(),
        exhausted = report.retries.exhausted.len(),
        promoted = report.promoted,
        missing_inputs = report.missing_inputs.len(),
        runnable = report.runnable,
        "Prepared batch"
    );

    Ok(report)
}

/// prepare (unless running as an array task) and execute the batch
#[instrument(skip_all, level = "info")]
pub fn run_batch(config: &Config, patterns: &FilterPatterns, log_level: &str) -> Result<BatchSummary, BatchError> {
    let executor = Executors::load(config, patterns.clone(), log_level)?;

    if executor.prepares() {
        prepare(config, patterns)?;
    }

    let summary = executor.execute(config)?;
    info!(%summary, "Batch finished");

    Ok(summary)
}

/// counts per status and, if asked for, the records that did not complete
pub fn status(config: &Config, unsuccessful: bool) -> Result<(StatusSummary, Vec<RunRecord>), BatchError> {
    let ledger = open_ledger(config)?;
    let summary = ledger.summary()?;

    let records = if unsuccessful {
        ledger
            .snapshot()?
            .records()
            .iter()
            .filter(|record| {
                matches!(
                    record.status,
                    RunStatus::Failed | RunStatus::Error | RunStatus::Exhausted
                )
            })
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    Ok((summary, records))
}

/// requeue FAILED and ERROR runs, all of them or just `run_ids`, and refreeze the batch
/// snapshot so workers see the new revisions
pub fn retry(config: &Config, run_ids: &[RunId]) -> Result<RetryReport, BatchError> {
    let ledger = open_ledger(config)?;
    let only = if run_ids.is_empty() { None } else { Some(run_ids) };

    let report = ledger.dispatch_retries(only)?;
    for run_id in report.ignored.iter() {
        warn!(run_id = %run_id, "Run is not FAILED or ERROR, not requeued");
    }

    refreeze(config, &ledger, &report.requeued)?;

    Ok(report)
}

/// replace the frozen snapshot with the current records of its runs plus `requeued`
fn refreeze(config: &Config, ledger: &Ledger, requeued: &[RunId]) -> Result<(), LedgerError> {
    let path = config.snapshot_path();
    let live = ledger.snapshot()?;

    let snapshot = if path.is_file() {
        let frozen = LedgerSnapshot::load(&path)?;
        let run_ids: HashSet<&RunId> = frozen
            .records()
            .iter()
            .map(|record| record.run_id())
            .chain(requeued.iter())
            .collect();

        live.narrowed(&run_ids)
    } else {
        live
    };

    snapshot.save(&path)?;
    info!(records = snapshot.records().len(), "Refroze batch snapshot");

    Ok(())
}
