use crate::{
    catalog::{RunFilter, RunId},
    ledger::LedgerSnapshot,
};
use std::ops::Range;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Worker count must be at least 1")]
    NoWorkers,
    #[error("Worker index {index} is outside of 1..={count}")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Runs assigned to one worker of a batch invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerAssignment {
    // 1-based
    pub worker_index: usize,
    pub worker_count: usize,
    pub run_ids: Vec<RunId>,
}

/// positions of the `index`-th of `count` contiguous blocks over `total` items
///
/// Blocks have ceil(total / count) items, the last non-empty block may be shorter and
/// trailing blocks may be empty.
pub fn block_bounds(total: usize, index: usize, count: usize) -> Result<Range<usize>, PartitionError> {
    if count == 0 {
        return Err(PartitionError::NoWorkers);
    }
    if index == 0 || index > count {
        return Err(PartitionError::IndexOutOfRange { index, count });
    }

    let size = (total + count - 1) / count;
    let start = (size * (index - 1)).min(total);
    let end = (start + size).min(total);

    Ok(start..end)
}

/// split already ordered run ids into the block of one worker
pub fn partition_ids(
    run_ids: &[RunId],
    index: usize,
    count: usize,
) -> Result<WorkerAssignment, PartitionError> {
    let bounds = block_bounds(run_ids.len(), index, count)?;

    Ok(WorkerAssignment {
        worker_index: index,
        worker_count: count,
        run_ids: run_ids[bounds].to_vec(),
    })
}

/// the share of the snapshot's runnable work for worker `index` of `count`
pub fn partition(
    snapshot: &LedgerSnapshot,
    filter: &RunFilter,
    index: usize,
    count: usize,
) -> Result<WorkerAssignment, PartitionError> {
    let runnable = snapshot
        .runnable(filter)
        .into_iter()
        .map(|record| record.spec.run_id.clone())
        .collect::<Vec<_>>();

    let assignment = partition_ids(&runnable, index, count)?;
    debug!(
        worker_index = index,
        worker_count = count,
        runnable = runnable.len(),
        assigned = assignment.run_ids.len(),
        "Partitioned snapshot"
    );

    Ok(assignment)
}
