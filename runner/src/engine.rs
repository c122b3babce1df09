use crate::{
    adapters::{AdapterError, AdapterRegistry, GeneratedInputs, ModelAdapter, ParsedOutput, RunContext},
    catalog::{RunId, RunSpec},
    config::{Config, ConfigErrors},
    distributed::{fs::ClaimMarker, WorkerAssignment},
    ledger::{Ledger, LedgerError, LedgerSnapshot, RecordUpdate, RunRecord, RunStatus, Stage},
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// standardized values of a completed run
pub const OUTPUTS_FILE: &str = "outputs.yaml";

/// Outcome counts of one worker's block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub error: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn record(&mut self, status: RunStatus) {
        match status {
            RunStatus::Completed => self.completed += 1,
            RunStatus::Failed | RunStatus::Error => self.error += 1,
            RunStatus::Exhausted => self.exhausted += 1,
            _ => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &BatchSummary) {
        self.completed += other.completed;
        self.error += other.error;
        self.exhausted += other.exhausted;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.completed + self.error + self.exhausted + self.skipped
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} error, {} exhausted, {} skipped",
            self.completed, self.error, self.exhausted, self.skipped
        )
    }
}

#[derive(Serialize)]
struct StandardOutputs<'a> {
    run_id: &'a RunId,
    crop_model: &'a str,
    values: &'a BTreeMap<String, f64>,
    output_paths: &'a BTreeMap<String, PathBuf>,
}

/// Executes the runs of one assignment sequentially
pub struct Engine<'a> {
    config: &'a Config,
    ledger: Ledger,
    registry: AdapterRegistry,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a Config, ledger: Ledger) -> Result<Self, ConfigErrors> {
        Ok(Self {
            config,
            ledger,
            registry: AdapterRegistry::load(config)?,
        })
    }

    /// process every run of `assignment`, only fatal ledger errors stop the worker
    #[instrument(
        skip_all,
        level = "info",
        fields(worker_index = assignment.worker_index, worker_count = assignment.worker_count)
    )]
    pub fn execute(
        &self,
        assignment: &WorkerAssignment,
        snapshot: &LedgerSnapshot,
    ) -> Result<BatchSummary, LedgerError> {
        let total = assignment.run_ids.len();
        let mut summary = BatchSummary::default();

        info!(runs = total, "Starting block");

        for (processed, run_id) in assignment.run_ids.iter().enumerate() {
            match snapshot.get(run_id) {
                Some(record) => summary.record(self.execute_run(record)?),
                None => {
                    warn!(run_id = %run_id, "Run is not part of the snapshot, skipping");
                    summary.skipped += 1;
                }
            }

            info!("Done with {}/{}", processed + 1, total);
        }

        info!(%summary, "Finished block");

        Ok(summary)
    }

    /// claim, drive and finalize one run, returning the status it ended up in
    fn execute_run(&self, record: &RunRecord) -> Result<RunStatus, LedgerError> {
        let run_id = record.run_id();
        let working_dir = self.config.working_dir(run_id);

        let claimed = match self.ledger.transition(
            run_id,
            RunStatus::ReadyToRun,
            RunStatus::Running,
            RecordUpdate {
                increment_attempts: true,
                working_dir: Some(working_dir.clone()),
                expected_revision: Some(record.revision),
                ..Default::default()
            },
        ) {
            Ok(claimed) => claimed,
            Err(error) if !error.is_fatal() => {
                warn!(run_id = %run_id, error = %error, "Failed to claim run, skipping");
                return Ok(RunStatus::ReadyToRun);
            }
            Err(error) => return Err(error),
        };

        debug!(run_id = %run_id, attempt = claimed.attempts, "Claimed run");

        let (marker, result) = match place_marker(&working_dir) {
            Ok(marker) => (Some(marker), self.drive(&claimed.spec, &working_dir)),
            Err(error) => (None, Err(error)),
        };

        // a fatal error returns before the marker is released
        let status = self.finish(&claimed, result)?;

        if let Some(marker) = marker {
            marker.release();
        }

        Ok(status)
    }

    fn drive(&self, spec: &RunSpec, working_dir: &Path) -> Result<ParsedOutput, AdapterError> {
        let adapter = self.registry.require(&spec.crop_model)?;
        let context = RunContext::new(self.config, spec, working_dir)?;

        let inputs = GeneratedInputs {
            weather: adapter.generate_weather(&context)?,
            soil: adapter.generate_soil(&context)?,
        };
        let experiment = adapter.generate_experiment(&context, &inputs)?;

        let run = adapter.run_model(&context, &experiment)?;
        debug!(run_id = %spec.run_id, elapsed = ?run.elapsed, "Model run succeeded");

        let output = adapter.parse_output(&context)?;
        write_outputs(spec, working_dir, &output)?;

        Ok(output)
    }

    fn finish(
        &self,
        claimed: &RunRecord,
        result: Result<ParsedOutput, AdapterError>,
    ) -> Result<RunStatus, LedgerError> {
        let run_id = claimed.run_id();

        let (next, update) = match result {
            Ok(output) => {
                info!(run_id = %run_id, attempt = claimed.attempts, "Run completed");

                (
                    RunStatus::Completed,
                    RecordUpdate {
                        output_paths: Some(output.output_paths),
                        clear_error: true,
                        ..Default::default()
                    },
                )
            }
            Err(error) => {
                // the kind of failure lives in last_error
                let next = if claimed.attempts >= self.ledger.max_retries() {
                    RunStatus::Exhausted
                } else {
                    RunStatus::Error
                };

                error!(
                    run_id = %run_id,
                    attempt = claimed.attempts,
                    kind = ?error.kind(),
                    stage = %error.stage(),
                    status = %next,
                    error = %error,
                    "Run failed"
                );

                (
                    next,
                    RecordUpdate {
                        last_error: Some(error.to_run_error()),
                        ..Default::default()
                    },
                )
            }
        };

        match self.ledger.transition(run_id, RunStatus::Running, next, update) {
            Ok(record) => Ok(record.status),
            Err(error) if !error.is_fatal() => {
                warn!(run_id = %run_id, error = %error, "Failed to store the outcome of the run");
                Ok(RunStatus::Running)
            }
            Err(error) => Err(error),
        }
    }
}

fn place_marker(working_dir: &Path) -> Result<ClaimMarker, AdapterError> {
    fs::create_dir_all(working_dir)
        .and_then(|_| ClaimMarker::place(working_dir))
        .map_err(|error| {
            AdapterError::setup(
                Stage::Prepare,
                format!("failed to set up working directory {working_dir:?}: {error}"),
            )
        })
}

fn write_outputs(spec: &RunSpec, working_dir: &Path, output: &ParsedOutput) -> Result<(), AdapterError> {
    let path = working_dir.join(OUTPUTS_FILE);
    let content = serde_yaml::to_string(&StandardOutputs {
        run_id: &spec.run_id,
        crop_model: &spec.crop_model,
        values: &output.values,
        output_paths: &output.output_paths,
    })
    .map_err(AdapterError::parse)?;

    fs::write(&path, content).map_err(|error| AdapterError::parse(format!("failed to write {path:?}: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::process::EXECUTION_LOG,
        catalog::{Catalog, RunFilter},
        distributed::{fs::CLAIM_MARKER, partition},
        ledger::{ErrorKind, LedgerSettings},
        testing::Fixture,
    };
    use std::time::{Duration, Instant};

    fn ready_ledger(config: &Config) -> (Ledger, LedgerSnapshot) {
        let registry = AdapterRegistry::load(config).unwrap();
        let catalog = Catalog::build(config, &registry, &RunFilter::default()).unwrap();
        let ledger = Ledger::open(&config.ledger_path(), LedgerSettings::from_config(config)).unwrap();

        ledger.seed(catalog.specs()).unwrap();
        let ids = catalog.specs().iter().map(|s| s.run_id.clone()).collect::<Vec<_>>();
        ledger.promote_ready(&ids).unwrap();
        let snapshot = ledger.snapshot().unwrap();

        (ledger, snapshot)
    }

    fn run_all(engine: &Engine<'_>, snapshot: &LedgerSnapshot, workers: usize) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for index in 1..=workers {
            let assignment = partition(snapshot, &RunFilter::default(), index, workers).unwrap();
            summary.merge(&engine.execute(&assignment, snapshot).unwrap());
        }
        summary
    }

    #[test]
    fn failing_model_succeeds_on_retry() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.simulation.adaptations = vec!["baseline".to_owned()];
        let (ledger, snapshot) = ready_ledger(&config);
        let engine = Engine::new(&config, ledger.clone()).unwrap();

        assert_eq!(snapshot.records().len(), 4);
        let first = run_all(&engine, &snapshot, 2);
        assert_eq!(first.completed, 2);
        assert_eq!(first.error, 2);

        for record in ledger.snapshot().unwrap().records() {
            if record.spec.crop_model == "B" {
                assert_eq!(record.status, RunStatus::Error);
                let error = record.last_error.clone().unwrap();
                assert_eq!(error.kind, ErrorKind::Execution);
                assert_eq!(error.stage, Stage::Model);
            }
        }

        let retried = ledger.dispatch_retries(None).unwrap();
        assert_eq!(retried.requeued.len(), 2);

        let second = run_all(&engine, &ledger.snapshot().unwrap(), 2);
        assert_eq!(second.completed, 2);

        for record in ledger.snapshot().unwrap().records() {
            assert_eq!(record.status, RunStatus::Completed);
            assert_eq!(record.last_error, None);

            let expected = if record.spec.crop_model == "B" { 2 } else { 1 };
            assert_eq!(record.attempts, expected, "{}", record.run_id());

            let working_dir = record.working_dir.clone().unwrap();
            assert!(working_dir.join(OUTPUTS_FILE).is_file());
            assert!(working_dir.join(EXECUTION_LOG).is_file());
            assert!(!working_dir.join(CLAIM_MARKER).exists());
            assert!(record.output_paths.contains_key("yield"));
        }

        let outputs = fs::read_to_string(
            config
                .working_dir(snapshot.records()[0].run_id())
                .join(OUTPUTS_FILE),
        )
        .unwrap();
        assert!(outputs.contains("yield:"));
    }

    #[test]
    fn timeouts_are_isolated_to_their_run() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.simulation.adaptations = vec!["baseline".to_owned()];
        let model = config.crop_models.get_mut("B").unwrap();
        model.executable = fixture.script("sleep");
        model.timeout = Some(1);

        let (ledger, snapshot) = ready_ledger(&config);
        let engine = Engine::new(&config, ledger.clone()).unwrap();

        let start = Instant::now();
        let summary = run_all(&engine, &snapshot, 1);
        assert!(start.elapsed() < Duration::from_secs(25));

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.error, 2);

        for record in ledger.snapshot().unwrap().records() {
            if record.spec.crop_model == "B" {
                assert_eq!(record.status, RunStatus::Error);
                let error = record.last_error.clone().unwrap();
                assert_eq!(error.kind, ErrorKind::Timeout);
                assert_eq!(error.stage, Stage::Model);
            } else {
                assert_eq!(record.status, RunStatus::Completed);
            }
        }
    }

    #[test]
    fn retries_end_in_exhausted() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.simulation.models = vec!["B".to_owned()];
        config.simulation.adaptations = vec!["baseline".to_owned()];
        config.crop_models.get_mut("B").unwrap().executable = fixture.script("fail");
        config.execution.max_retries = 2;

        let (ledger, snapshot) = ready_ledger(&config);
        let engine = Engine::new(&config, ledger.clone()).unwrap();

        assert_eq!(run_all(&engine, &snapshot, 1).error, 2);
        ledger.dispatch_retries(None).unwrap();
        assert_eq!(run_all(&engine, &ledger.snapshot().unwrap(), 1).exhausted, 2);

        for record in ledger.snapshot().unwrap().records() {
            assert_eq!(record.status, RunStatus::Exhausted);
            assert_eq!(record.attempts, 2);
            assert_eq!(record.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Execution));
        }

        // nothing left to dispatch
        let report = ledger.dispatch_retries(None).unwrap();
        assert!(report.requeued.is_empty() && report.exhausted.is_empty());
    }

    #[test]
    fn stale_snapshots_skip_claimed_runs() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.simulation.models = vec!["A".to_owned()];
        config.simulation.adaptations = vec!["baseline".to_owned()];

        let (ledger, snapshot) = ready_ledger(&config);
        let engine = Engine::new(&config, ledger.clone()).unwrap();

        assert_eq!(run_all(&engine, &snapshot, 1).completed, 2);
        // same snapshot again, every claim is rejected
        let again = run_all(&engine, &snapshot, 1);
        assert_eq!(again.skipped, 2);
        assert_eq!(again.completed, 0);

        for record in ledger.snapshot().unwrap().records() {
            assert_eq!(record.attempts, 1);
        }
    }

    #[test]
    fn summary_counts_merge() {
        let mut summary = BatchSummary::default();
        summary.record(RunStatus::Completed);
        summary.record(RunStatus::Error);

        let mut other = BatchSummary::default();
        other.record(RunStatus::Exhausted);
        other.record(RunStatus::ReadyToRun);

        summary.merge(&other);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.to_string(), "1 completed, 1 error, 1 exhausted, 1 skipped");
    }
}
