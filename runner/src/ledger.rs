mod snapshot;
mod sqlite;

pub use snapshot::{LedgerSnapshot, SnapshotError};
pub use sqlite::Ledger;

use crate::{
    catalog::{RunId, RunSpec},
    config::Config,
    sync::{LockError, LockSettings},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    io,
    path::PathBuf,
    str::FromStr,
};
use thiserror::Error;

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    ReadyToRun,
    Running,
    Completed,
    Failed,
    Error,
    Exhausted,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        Self::Pending,
        Self::ReadyToRun,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Error,
        Self::Exhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ReadyToRun => "READY_TO_RUN",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Exhausted => "EXHAUSTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Exhausted)
    }

    /// FAILED or ERROR, i.e. eligible for retry dispatch
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    /// edges of the regular state machine
    ///
    /// The demotion of abandoned RUNNING records back to READY_TO_RUN is not part of it and
    /// only happens through `Ledger::reconcile_stale_running`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, next),
            (Pending, ReadyToRun)
                | (ReadyToRun, Running)
                | (Running, Completed | Failed | Error | Exhausted)
                | (Failed | Error, ReadyToRun | Exhausted)
        )
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown run status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_owned()))
    }
}

/// Classification of a per run failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Setup,
    Execution,
    Timeout,
    Parse,
    Configuration,
}

/// Step of the run pipeline a failure happened in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Prepare,
    Weather,
    Soil,
    Experiment,
    Model,
    Output,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Weather => "weather",
            Self::Soil => "soil",
            Self::Experiment => "experiment",
            Self::Model => "model",
            Self::Output => "output",
        })
    }
}

/// Failure stored with a run record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {}: {}", self.kind, self.stage, self.message)
    }
}

/// Persisted state of one run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub spec: RunSpec,
    pub status: RunStatus,
    pub attempts: u32,
    pub last_error: Option<RunError>,
    pub working_dir: Option<PathBuf>,
    // standardized variable -> file the value was read from
    pub output_paths: BTreeMap<String, PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
}

impl RunRecord {
    pub fn run_id(&self) -> &RunId {
        &self.spec.run_id
    }
}

/// Changes applied together with a status transition
#[derive(Clone, Debug, Default)]
pub struct RecordUpdate {
    pub increment_attempts: bool,
    pub last_error: Option<RunError>,
    pub clear_error: bool,
    pub output_paths: Option<BTreeMap<String, PathBuf>>,
    pub working_dir: Option<PathBuf>,
    // compare-and-set guard, the transition fails if the record moved on since
    pub expected_revision: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct LedgerSettings {
    pub lock: LockSettings,
    pub max_retries: u32,
}

impl LedgerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock: LockSettings::from_config(&config.execution),
            max_retries: config.execution.max_retries,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub inserted: usize,
    pub existing: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub requeued: Vec<RunId>,
    pub exhausted: Vec<RunId>,
    // explicitly requested runs that were not FAILED or ERROR
    pub ignored: Vec<RunId>,
}

/// Number of records per status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSummary(pub BTreeMap<RunStatus, usize>);

impl StatusSummary {
    pub fn count(&self, status: RunStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

impl Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in RunStatus::ALL {
            writeln!(f, "{:<14}{:>8}", status.as_str(), self.count(status))?;
        }
        write!(f, "{:<14}{:>8}", "TOTAL", self.total())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("Failed to create ledger directory {path:?}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("Failed to encode ledger column: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("Run {0} is not in the ledger")]
    UnknownRun(RunId),
    #[error("Run {run_id} cannot move from {from} to {to}: {reason}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        reason: String,
    },
    #[error("Run {run_id} was modified concurrently (revision {actual}, expected {expected})")]
    StaleRevision {
        run_id: RunId,
        expected: i64,
        actual: i64,
    },
}

impl LedgerError {
    /// fatal errors stop a worker, the others only concern a single run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UnknownRun(_) | Self::InvalidTransition { .. } | Self::StaleRevision { .. }
        )
    }
}
