/*
 * Coordinator-less work distribution:
 * 1. prepare freezes one snapshot of the ledger for the batch
 * 2. every worker partitions that snapshot by (worker_index, worker_count)
 * 3. a claim is a compare-and-set on status and revision in the ledger, so overlapping
 *    invocations with different snapshots never execute a run twice
 */

pub mod fs;
pub mod partition;
pub mod util;


pub use partition::{partition, PartitionError, WorkerAssignment};
