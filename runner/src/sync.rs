pub mod locking;

pub use locking::{LedgerLock, LockError, LockGuard, LockSettings};
