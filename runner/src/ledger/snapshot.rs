use super::{RunRecord, RunStatus};
use crate::{
    catalog::{RunFilter, RunId},
    distributed::util::HOSTNAME,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;
use tracing::{debug, warn};

// distinguishes saves from threads of the same process
static SAVE_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to access snapshot {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Snapshot {path:?} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Read-only copy of the ledger, ordered by run id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    taken_at: DateTime<Utc>,
    records: Vec<RunRecord>,
}

impl LedgerSnapshot {
    pub fn new(taken_at: DateTime<Utc>, mut records: Vec<RunRecord>) -> Self {
        records.sort_by(|a, b| a.spec.run_id.cmp(&b.spec.run_id));

        Self { taken_at, records }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn get(&self, run_id: &RunId) -> Option<&RunRecord> {
        self.records
            .binary_search_by(|record| record.spec.run_id.cmp(run_id))
            .ok()
            .map(|index| &self.records[index])
    }

    /// READY_TO_RUN records matching `filter`, in run id order
    pub fn runnable<'a>(&'a self, filter: &RunFilter) -> Vec<&'a RunRecord> {
        self.records
            .iter()
            .filter(|record| record.status == RunStatus::ReadyToRun && filter.matches(&record.spec))
            .collect()
    }

    /// keep only the records of `run_ids`
    pub fn narrowed(self, run_ids: &HashSet<&RunId>) -> Self {
        Self {
            taken_at: self.taken_at,
            records: self
                .records
                .into_iter()
                .filter(|record| run_ids.contains(&record.spec.run_id))
                .collect(),
        }
    }

    /// write the snapshot next to its final location and move it into place
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let io_error = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        // every writer gets its own temporary file, the rename decides who wins
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(
            ".{}.{}.{}.tmp",
            HOSTNAME.as_str(),
            process::id(),
            SAVE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp = PathBuf::from(tmp);

        let encoded = serde_json::to_vec_pretty(self).map_err(|source| SnapshotError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(&tmp, encoded).map_err(io_error)?;
        if let Err(error) = fs::rename(&tmp, path) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!(error = ?cleanup, path = ?tmp, "Failed to remove temporary snapshot");
            }
            return Err(io_error(error));
        }

        debug!(path = ?path, records = self.records.len(), "Saved batch snapshot");

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = fs::read(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: Self =
            serde_json::from_slice(&raw).map_err(|source| SnapshotError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        // a hand edited file might not be sorted anymore
        Ok(Self::new(snapshot.taken_at, snapshot.records))
    }
}
