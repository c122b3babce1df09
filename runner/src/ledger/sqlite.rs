use super::{
    LedgerError, LedgerSettings, LedgerSnapshot, RecordUpdate, RetryReport, RunError, RunRecord,
    RunStatus, SeedReport, StatusSummary,
};
use crate::{
    catalog::{RunId, RunSpec},
    sync::LedgerLock,
};
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef},
    Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

impl ToSql for RunId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(RunId::from)
    }
}

#[derive(Debug, Clone)]
/// Transparent, thread safe handle on the run ledger
///
/// Every operation holds the in-process mutex and the cross-process file lock for the
/// duration of one SQLite transaction.
pub struct Ledger(Arc<FairMutex<InnerLedger>>);

#[derive(Debug)]
pub struct InnerLedger {
    connection: Connection,
    lock: LedgerLock,
    max_retries: u32,
    path: PathBuf,
}

impl Ledger {
    /// open (or create) the ledger at `path` and apply the schema
    pub fn open(path: &Path, settings: LedgerSettings) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock = LedgerLock::beside(path, settings.lock);
        let connection = {
            let _guard = lock.acquire()?;
            let connection = Connection::open(path)?;
            connection.busy_timeout(settings.lock.timeout)?;
            InnerLedger::apply_schema(&connection)?;

            connection
        };

        debug!(path = ?path, max_retries = settings.max_retries, "Opened ledger");

        Ok(Self(Arc::new(FairMutex::new(InnerLedger {
            connection,
            lock,
            max_retries: settings.max_retries,
            path: path.to_path_buf(),
        }))))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerLedger> {
        self.0.lock_arc()
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    pub fn max_retries(&self) -> u32 {
        self.lock().max_retries
    }

    /// insert every spec not yet in the ledger as PENDING
    #[instrument(skip_all, level = "info")]
    pub fn seed(&self, specs: &[RunSpec]) -> Result<SeedReport, LedgerError> {
        self.lock().write(|tx, _| {
            let now = Utc::now();
            let mut report = SeedReport::default();
            let mut insert = tx.prepare_cached(
                "insert or ignore into runs
                 (run_id, location_id, climate_source, gcm, rcm, scenario, period,
                  crop_model, adaptation, sowing_date, status, attempts, output_paths,
                  created_at, updated_at, revision)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, '{}', ?, ?, 0)",
            )?;

            for spec in specs {
                let changed = insert.execute(params![
                    spec.run_id,
                    spec.location_id,
                    spec.climate_source,
                    spec.gcm,
                    spec.rcm,
                    spec.scenario,
                    spec.period,
                    spec.crop_model,
                    spec.adaptation,
                    spec.sowing_date,
                    RunStatus::Pending,
                    now,
                    now,
                ])?;

                if changed == 0 {
                    report.existing += 1;
                } else {
                    report.inserted += 1;
                }
            }

            info!(
                inserted = report.inserted,
                existing = report.existing,
                "Seeded ledger"
            );

            Ok(report)
        })
    }

    /// read-only copy of every record
    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        self.lock().write(|tx, _| {
            let records = InnerLedger::records(tx, None)?;

            Ok(LedgerSnapshot::new(Utc::now(), records))
        })
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>, LedgerError> {
        self.lock().write(|tx, _| InnerLedger::record(tx, run_id))
    }

    pub fn summary(&self) -> Result<StatusSummary, LedgerError> {
        self.lock().write(|tx, _| {
            tx.prepare_cached("select status, count(*) from runs group by status")?
                .query_map([], |row| {
                    Ok((row.get::<_, RunStatus>(0)?, row.get::<_, i64>(1)? as usize))
                })?
                .try_fold(BTreeMap::new(), |mut init, result| {
                    let (status, count) = result?;
                    init.insert(status, count);

                    Ok::<_, LedgerError>(init)
                })
                .map(StatusSummary)
        })
    }

    /// atomically move `run_id` from `expected` to `next` and apply `update`
    pub fn transition(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        update: RecordUpdate,
    ) -> Result<RunRecord, LedgerError> {
        self.lock().write(|tx, max_retries| {
            let record =
                InnerLedger::record(tx, run_id)?.ok_or_else(|| LedgerError::UnknownRun(run_id.clone()))?;

            if record.status != expected {
                return Err(LedgerError::InvalidTransition {
                    run_id: run_id.clone(),
                    from: record.status,
                    to: next,
                    reason: format!("expected the run to be {expected}"),
                });
            }

            if let Some(revision) = update.expected_revision {
                if record.revision != revision {
                    return Err(LedgerError::StaleRevision {
                        run_id: run_id.clone(),
                        expected: revision,
                        actual: record.revision,
                    });
                }
            }

            let attempts = record.attempts + u32::from(update.increment_attempts);
            check_edge(&record, next, attempts, max_retries)?;

            let last_error = if update.last_error.is_some() {
                update.last_error
            } else if update.clear_error {
                None
            } else {
                record.last_error
            };

            let updated = RunRecord {
                status: next,
                attempts,
                last_error,
                working_dir: update.working_dir.or(record.working_dir),
                output_paths: update.output_paths.unwrap_or(record.output_paths),
                updated_at: Utc::now(),
                revision: record.revision + 1,
                ..record
            };

            InnerLedger::store(tx, &updated, record.revision)?;
            debug!(run_id = %run_id, from = %expected, to = %next, attempts, "Stored transition");

            Ok(updated)
        })
    }

    /// demote RUNNING records not updated within `threshold` to READY_TO_RUN
    ///
    /// Attempts stay untouched, the abandoned attempt already counted when it was claimed.
    #[instrument(skip(self), level = "info")]
    pub fn reconcile_stale_running(&self, threshold: Duration) -> Result<Vec<RunId>, LedgerError> {
        self.lock().write(|tx, _| {
            let now = Utc::now();
            let mut recovered = Vec::new();

            for record in InnerLedger::records(tx, Some(&[RunStatus::Running]))? {
                let stale = (now - record.updated_at)
                    .to_std()
                    .map_or(false, |age| age > threshold);
                if !stale {
                    continue;
                }

                warn!(
                    run_id = %record.run_id(),
                    last_update = %record.updated_at,
                    "Recovering abandoned run"
                );

                let revision = record.revision;
                let demoted = RunRecord {
                    status: RunStatus::ReadyToRun,
                    updated_at: now,
                    revision: revision + 1,
                    ..record
                };
                InnerLedger::store(tx, &demoted, revision)?;
                recovered.push(demoted.spec.run_id);
            }

            Ok(recovered)
        })
    }

    /// requeue FAILED and ERROR runs with attempts left, exhaust the others
    ///
    /// With `only` set, just the listed runs are considered.
    #[instrument(skip_all, level = "info")]
    pub fn dispatch_retries(&self, only: Option<&[RunId]>) -> Result<RetryReport, LedgerError> {
        self.lock().write(|tx, max_retries| {
            let now = Utc::now();
            let wanted: Option<HashSet<&RunId>> = only.map(|ids| ids.iter().collect());
            let mut report = RetryReport::default();
            let mut seen = HashSet::new();

            for record in InnerLedger::records(tx, Some(&[RunStatus::Failed, RunStatus::Error]))? {
                if let Some(wanted) = &wanted {
                    if !wanted.contains(record.run_id()) {
                        continue;
                    }
                }
                seen.insert(record.run_id().clone());

                let next = if record.attempts < max_retries {
                    RunStatus::ReadyToRun
                } else {
                    RunStatus::Exhausted
                };
                check_edge(&record, next, record.attempts, max_retries)?;

                let revision = record.revision;
                let dispatched = RunRecord {
                    status: next,
                    updated_at: now,
                    revision: revision + 1,
                    ..record
                };
                InnerLedger::store(tx, &dispatched, revision)?;

                match next {
                    RunStatus::ReadyToRun => report.requeued.push(dispatched.spec.run_id),
                    _ => report.exhausted.push(dispatched.spec.run_id),
                }
            }

            if let Some(ids) = only {
                report.ignored = ids
                    .iter()
                    .filter(|id| !seen.contains(*id))
                    .cloned()
                    .collect();
            }

            info!(
                requeued = report.requeued.len(),
                exhausted = report.exhausted.len(),
                ignored = report.ignored.len(),
                "Dispatched retries"
            );

            Ok(report)
        })
    }

    /// move PENDING runs whose inputs are materialized to READY_TO_RUN
    pub fn promote_ready(&self, run_ids: &[RunId]) -> Result<usize, LedgerError> {
        self.lock().write(|tx, _| {
            let now = Utc::now();
            let mut promote = tx.prepare_cached(
                "update runs set status = ?, updated_at = ?, revision = revision + 1
                 where run_id = ? and status = ?",
            )?;

            let mut promoted = 0;
            for run_id in run_ids {
                promoted += promote.execute(params![
                    RunStatus::ReadyToRun,
                    now,
                    run_id,
                    RunStatus::Pending
                ])?;
            }

            Ok(promoted)
        })
    }
}

// validate an edge including the retry bound
fn check_edge(
    record: &RunRecord,
    next: RunStatus,
    attempts: u32,
    max_retries: u32,
) -> Result<(), LedgerError> {
    let invalid = |reason: String| LedgerError::InvalidTransition {
        run_id: record.run_id().clone(),
        from: record.status,
        to: next,
        reason,
    };

    if !record.status.can_transition_to(next) {
        return Err(invalid("not an edge of the state machine".to_owned()));
    }

    match (record.status, next) {
        (RunStatus::Running, RunStatus::Exhausted) | (RunStatus::Failed | RunStatus::Error, RunStatus::Exhausted)
            if attempts < max_retries =>
        {
            Err(invalid(format!(
                "only {attempts} of {max_retries} attempts were used"
            )))
        }
        (RunStatus::Running, RunStatus::Failed | RunStatus::Error)
        | (RunStatus::Failed | RunStatus::Error, RunStatus::ReadyToRun)
            if attempts >= max_retries =>
        {
            Err(invalid(format!(
                "all {max_retries} attempts were used, the run is exhausted"
            )))
        }
        _ => Ok(()),
    }
}

impl InnerLedger {
    fn apply_schema(connection: &Connection) -> Result<(), LedgerError> {
        let mut counter = 1;

        for statement in SQL_SCHEMA {
            match connection.execute(statement, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, statement = statement, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(LedgerError::Storage(error));
                }
            }

            counter += 1;
        }

        Ok(())
    }

    // run `operation` inside an immediate transaction while holding the ledger lock
    fn write<T>(
        &mut self,
        operation: impl FnOnce(&Transaction<'_>, u32) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let _guard = self.lock.acquire()?;
        let mut tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let value = operation(&tx, self.max_retries)?;
        tx.commit()?;

        Ok(value)
    }

    fn record(connection: &Connection, run_id: &RunId) -> Result<Option<RunRecord>, LedgerError> {
        connection
            .prepare_cached(&format!(
                "select {RECORD_COLUMNS} from runs where run_id = ?"
            ))?
            .query_row(params![run_id], record_from_row)
            .optional()
            .map_err(LedgerError::Storage)
    }

    fn records(
        connection: &Connection,
        statuses: Option<&[RunStatus]>,
    ) -> Result<Vec<RunRecord>, LedgerError> {
        let mut statement = connection.prepare_cached(&format!(
            "select {RECORD_COLUMNS} from runs order by run_id"
        ))?;

        let records = statement
            .query_map([], record_from_row)?
            .filter(|result| match (result, statuses) {
                (Ok(record), Some(statuses)) => statuses.contains(&record.status),
                _ => true,
            })
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<_, LedgerError>(init)
            })?;

        Ok(records)
    }

    // write back the mutable columns, guarded by the revision that was read
    fn store(connection: &Connection, record: &RunRecord, read_revision: i64) -> Result<(), LedgerError> {
        let last_error = record
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let output_paths = serde_json::to_string(&record.output_paths)?;
        let working_dir = record
            .working_dir
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());

        let changed = connection
            .prepare_cached(
                "update runs set status = ?, attempts = ?, last_error = ?, working_dir = ?,
                 output_paths = ?, updated_at = ?, revision = ?
                 where run_id = ? and revision = ?",
            )?
            .execute(params![
                record.status,
                record.attempts,
                last_error,
                working_dir,
                output_paths,
                record.updated_at,
                record.revision,
                record.spec.run_id,
                read_revision
            ])?;

        if changed == 1 {
            Ok(())
        } else {
            Err(LedgerError::StaleRevision {
                run_id: record.spec.run_id.clone(),
                expected: read_revision,
                actual: record.revision,
            })
        }
    }
}

const RECORD_COLUMNS: &str = "run_id, location_id, climate_source, gcm, rcm, scenario, period, \
    crop_model, adaptation, sowing_date, status, attempts, last_error, working_dir, \
    output_paths, created_at, updated_at, revision";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        spec: RunSpec {
            run_id: row.get(0)?,
            location_id: row.get(1)?,
            climate_source: row.get(2)?,
            gcm: row.get(3)?,
            rcm: row.get(4)?,
            scenario: row.get(5)?,
            period: row.get(6)?,
            crop_model: row.get(7)?,
            adaptation: row.get(8)?,
            sowing_date: row.get(9)?,
        },
        status: row.get(10)?,
        attempts: row.get(11)?,
        last_error: json_column::<Option<RunError>>(row, 12)?,
        working_dir: row.get::<_, Option<String>>(13)?.map(PathBuf::from),
        output_paths: json_column(row, 14)?,
        created_at: row.get::<_, DateTime<Utc>>(15)?,
        updated_at: row.get::<_, DateTime<Utc>>(16)?,
        revision: row.get(17)?,
    })
}

// JSON text column, NULL decodes as JSON null
fn json_column<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(index)?;

    serde_json::from_str(raw.as_deref().unwrap_or("null"))
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists runs (
    run_id text primary key,

    location_id text not null,
    climate_source text not null,
    gcm text not null,
    rcm text,
    scenario text not null,
    period text not null,
    crop_model text not null,
    adaptation text not null,
    sowing_date text not null,

    status text not null,
    attempts integer not null default 0,
    last_error text,
    working_dir text,
    output_paths text not null default '{}',
    created_at text not null,
    updated_at text not null,
    revision integer not null default 0
);",
    "create index if not exists runs_status on runs (status);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ClimateModel,
        ledger::{ErrorKind, Stage},
        sync::LockSettings,
    };
    use chrono::NaiveDate;
    use std::thread;

    fn settings(max_retries: u32) -> LedgerSettings {
        LedgerSettings {
            lock: LockSettings {
                timeout: Duration::from_secs(5),
                retry_interval: Duration::from_millis(5),
            },
            max_retries,
        }
    }

    fn specs(count: usize) -> Vec<RunSpec> {
        let climate = ClimateModel {
            gcm: "MPI-ESM".to_owned(),
            rcm: None,
            scenarios: vec!["ssp245".to_owned()],
            periods: Vec::new(),
        };

        (0..count)
            .map(|index| {
                RunSpec::new(
                    &format!("loc{index:02}"),
                    "cmip6",
                    &climate,
                    "ssp245",
                    "near",
                    "A",
                    "baseline",
                    NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(),
                )
            })
            .collect()
    }

    fn failure() -> RunError {
        RunError {
            kind: ErrorKind::Execution,
            stage: Stage::Model,
            message: "exit code 3".to_owned(),
        }
    }

    fn open(dir: &tempfile::TempDir, max_retries: u32) -> Ledger {
        Ledger::open(&dir.path().join("ledger").join("status.db"), settings(max_retries)).unwrap()
    }

    fn claim(ledger: &Ledger, run_id: &RunId) -> RunRecord {
        ledger
            .transition(
                run_id,
                RunStatus::ReadyToRun,
                RunStatus::Running,
                RecordUpdate {
                    increment_attempts: true,
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn seeding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 3);
        let specs = specs(3);

        let first = ledger.seed(&specs).unwrap();
        assert_eq!(first, SeedReport { inserted: 3, existing: 0 });

        let mut more = specs.clone();
        more.extend(self::specs(5).into_iter().skip(3));
        let second = ledger.seed(&more).unwrap();
        assert_eq!(second, SeedReport { inserted: 2, existing: 3 });

        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.records().len(), 5);
        assert!(snapshot
            .records()
            .iter()
            .all(|record| record.status == RunStatus::Pending && record.attempts == 0));
        assert_eq!(snapshot.records()[0].spec, specs[0]);
    }

    #[test]
    fn reopening_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let specs = specs(2);
        {
            let ledger = open(&dir, 3);
            ledger.seed(&specs).unwrap();
            ledger.promote_ready(&[specs[0].run_id.clone()]).unwrap();
        }

        let ledger = open(&dir, 3);
        let record = ledger.get(&specs[0].run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::ReadyToRun);
        assert_eq!(record.revision, 1);
    }

    #[test]
    fn rejected_transitions_leave_the_record_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 3);
        let specs = specs(1);
        let run_id = &specs[0].run_id;
        ledger.seed(&specs).unwrap();
        let before = ledger.get(run_id).unwrap().unwrap();

        // PENDING -> RUNNING skips materialization
        let error = ledger
            .transition(
                run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RecordUpdate {
                    increment_attempts: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(error, LedgerError::InvalidTransition { .. }));
        assert!(!error.is_fatal());

        // wrong expected status
        let error = ledger
            .transition(
                run_id,
                RunStatus::ReadyToRun,
                RunStatus::Running,
                RecordUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(
            error,
            LedgerError::InvalidTransition { from: RunStatus::Pending, .. }
        ));

        assert_eq!(ledger.get(run_id).unwrap().unwrap(), before);

        let unknown = ledger
            .transition(
                &RunId::from("missing"),
                RunStatus::Pending,
                RunStatus::ReadyToRun,
                RecordUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(unknown, LedgerError::UnknownRun(_)));
    }

    #[test]
    fn terminal_states_are_final() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 3);
        let specs = specs(1);
        let run_id = &specs[0].run_id;
        ledger.seed(&specs).unwrap();
        ledger.promote_ready(&[run_id.clone()]).unwrap();
        claim(&ledger, run_id);

        let mut outputs = BTreeMap::new();
        outputs.insert("yield".to_owned(), PathBuf::from("/setup/run/Summary.OUT"));
        let completed = ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Completed,
                RecordUpdate {
                    output_paths: Some(outputs.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(completed.output_paths, outputs);
        assert_eq!(completed.attempts, 1);

        for next in [RunStatus::ReadyToRun, RunStatus::Running, RunStatus::Failed] {
            assert!(ledger
                .transition(run_id, RunStatus::Completed, next, RecordUpdate::default())
                .is_err());
        }
        assert_eq!(ledger.get(run_id).unwrap().unwrap(), completed);
    }

    #[test]
    fn stale_revision_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 3);
        let specs = specs(1);
        let run_id = &specs[0].run_id;
        ledger.seed(&specs).unwrap();
        ledger.promote_ready(&[run_id.clone()]).unwrap();

        let seen = ledger.get(run_id).unwrap().unwrap();
        let claimed = ledger
            .transition(
                run_id,
                RunStatus::ReadyToRun,
                RunStatus::Running,
                RecordUpdate {
                    increment_attempts: true,
                    expected_revision: Some(seen.revision),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(claimed.revision, seen.revision + 1);

        // another worker reconciled and requeued the run in the meantime
        let error = ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Completed,
                RecordUpdate {
                    expected_revision: Some(seen.revision),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(error, LedgerError::StaleRevision { .. }));
        assert!(!error.is_fatal());
        assert_eq!(ledger.get(run_id).unwrap().unwrap(), claimed);
    }

    #[test]
    fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 2);
        let specs = specs(1);
        let run_id = &specs[0].run_id;
        ledger.seed(&specs).unwrap();
        ledger.promote_ready(&[run_id.clone()]).unwrap();

        claim(&ledger, run_id);
        // attempts 1 of 2, exhausting is premature
        assert!(ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Exhausted,
                RecordUpdate::default()
            )
            .is_err());
        ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Failed,
                RecordUpdate {
                    last_error: Some(failure()),
                    ..Default::default()
                },
            )
            .unwrap();

        let report = ledger.dispatch_retries(None).unwrap();
        assert_eq!(report.requeued, vec![run_id.clone()]);

        claim(&ledger, run_id);
        // attempts 2 of 2, FAILED is no longer allowed
        assert!(ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Failed,
                RecordUpdate::default()
            )
            .is_err());
        let exhausted = ledger
            .transition(
                run_id,
                RunStatus::Running,
                RunStatus::Exhausted,
                RecordUpdate {
                    last_error: Some(failure()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.last_error, Some(failure()));

        assert_eq!(ledger.dispatch_retries(None).unwrap(), RetryReport::default());
    }

    #[test]
    fn dispatch_exhausts_runs_without_attempts_left() {
        let dir = tempfile::tempdir().unwrap();
        let specs = specs(2);
        {
            let ledger = open(&dir, 3);
            ledger.seed(&specs).unwrap();
            ledger
                .promote_ready(&specs.iter().map(|s| s.run_id.clone()).collect::<Vec<_>>())
                .unwrap();
            for spec in specs.iter() {
                claim(&ledger, &spec.run_id);
                ledger
                    .transition(
                        &spec.run_id,
                        RunStatus::Running,
                        RunStatus::Error,
                        RecordUpdate {
                            last_error: Some(failure()),
                            ..Default::default()
                        },
                    )
                    .unwrap();
            }
        }

        // the retry budget was lowered between invocations
        let ledger = open(&dir, 1);
        let only = [specs[1].run_id.clone(), RunId::from("unknown")];
        let report = ledger.dispatch_retries(Some(&only)).unwrap();

        assert_eq!(report.exhausted, vec![specs[1].run_id.clone()]);
        assert!(report.requeued.is_empty());
        assert_eq!(report.ignored, vec![RunId::from("unknown")]);
        assert_eq!(
            ledger.get(&specs[0].run_id).unwrap().unwrap().status,
            RunStatus::Error
        );
    }

    #[test]
    fn stale_running_records_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir, 3);
        let specs = specs(2);
        ledger.seed(&specs).unwrap();
        ledger
            .promote_ready(&specs.iter().map(|s| s.run_id.clone()).collect::<Vec<_>>())
            .unwrap();
        let crashed = claim(&ledger, &specs[0].run_id);

        // a live run is not touched with a generous threshold
        assert!(ledger
            .reconcile_stale_running(Duration::from_secs(3600))
            .unwrap()
            .is_empty());

        thread::sleep(Duration::from_millis(20));
        let recovered = ledger.reconcile_stale_running(Duration::from_millis(1)).unwrap();
        assert_eq!(recovered, vec![specs[0].run_id.clone()]);

        let record = ledger.get(&specs[0].run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::ReadyToRun);
        assert_eq!(record.attempts, crashed.attempts);

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.count(RunStatus::ReadyToRun), 2);
        assert_eq!(summary.count(RunStatus::Running), 0);
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn concurrent_claims_yield_a_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.db");
        let specs = specs(1);
        let run_id = specs[0].run_id.clone();
        {
            let ledger = Ledger::open(&path, settings(3)).unwrap();
            ledger.seed(&specs).unwrap();
            ledger.promote_ready(&[run_id.clone()]).unwrap();
        }

        // separate connections behave like separate worker processes
        let handles = (0..4)
            .map(|_| {
                let path = path.clone();
                let run_id = run_id.clone();
                thread::spawn(move || {
                    let ledger = Ledger::open(&path, settings(3)).unwrap();
                    ledger
                        .transition(
                            &run_id,
                            RunStatus::ReadyToRun,
                            RunStatus::Running,
                            RecordUpdate {
                                increment_attempts: true,
                                ..Default::default()
                            },
                        )
                        .is_ok()
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        let ledger = Ledger::open(&path, settings(3)).unwrap();
        assert_eq!(ledger.get(&run_id).unwrap().unwrap().attempts, 1);
    }
}
