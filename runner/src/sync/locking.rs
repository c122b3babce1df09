use crate::config::ExecutionConfig;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

// upper bound for a single backoff step
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for the ledger lock {path:?}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("Failed to open lock file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to lock {path:?}: {source}")]
    Nix { path: PathBuf, source: Errno },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSettings {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl LockSettings {
    pub fn from_config(execution: &ExecutionConfig) -> Self {
        Self {
            timeout: execution.lock_timeout(),
            retry_interval: execution.lock_retry_interval(),
        }
    }
}

/// Advisory exclusive lock next to the ledger file
///
/// The lock works across processes and nodes as long as the shared filesystem honours
/// `flock`. Every acquisition opens its own file description, so two `LedgerLock`s in the
/// same process exclude each other as well.
#[derive(Clone, Debug)]
pub struct LedgerLock {
    path: PathBuf,
    settings: LockSettings,
}

impl LedgerLock {
    /// lock guarding `ledger`, stored as `<ledger>.lock`
    pub fn beside(ledger: &Path, settings: LockSettings) -> Self {
        let mut path = ledger.as_os_str().to_owned();
        path.push(".lock");

        Self {
            path: PathBuf::from(path),
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// block until the lock is held or the configured timeout elapsed
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;

        let start = Instant::now();
        let mut backoff = self.settings.retry_interval;
        let mut attempts = 0u32;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    if attempts > 0 {
                        debug!(
                            attempts,
                            waited = ?start.elapsed(),
                            "Acquired ledger lock after contention"
                        );
                    }

                    return Ok(LockGuard {
                        file,
                        path: self.path.clone(),
                    });
                }
                Err(Errno::EWOULDBLOCK) => {}
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(LockError::Nix {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            let waited = start.elapsed();
            if waited >= self.settings.timeout {
                warn!(path = ?self.path, ?waited, attempts, "Giving up on the ledger lock");

                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            attempts += 1;
            trace!(?backoff, "Ledger lock is busy, backing off");
            thread::sleep(backoff.min(self.settings.timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Holds the ledger lock until dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // closing the file releases the lock as well, unlocking explicitly just surfaces errors
        if let Err(error) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            error!(error = ?error, path = ?self.path, "Failed to release ledger lock");
        }
    }
}
