use super::util::HOSTNAME;
use chrono::Utc;
use std::{
    fs, io,
    ops::Deref,
    path::{Path, PathBuf},
    process,
};
use tracing::{debug, error, warn};

pub const CLAIM_MARKER: &str = ".claimed";

/// Marker in a run's working directory naming the process that claimed the run
///
/// Dropping keeps the marker in place, only `release` removes it.
#[derive(Debug)]
pub struct ClaimMarker {
    path: PathBuf,
}

impl ClaimMarker {
    pub fn place(working_dir: &Path) -> io::Result<Self> {
        let path = working_dir.join(CLAIM_MARKER);

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(previous) => warn!(
                    previous = previous.trim(),
                    "Replacing claim marker of an earlier attempt"
                ),
                Err(error) => warn!(error = ?error, "Replacing unreadable claim marker"),
            }
        }

        fs::write(
            &path,
            format!(
                "host={}\npid={}\nclaimed_at={}\n",
                *HOSTNAME,
                process::id(),
                Utc::now().to_rfc3339()
            ),
        )?;
        debug!(path = ?path, "Placed claim marker");

        Ok(Self { path })
    }

    /// remove the marker once the final state of the run is stored
    pub fn release(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released claim marker"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to remove claim marker"),
        }
    }
}

impl Deref for ClaimMarker {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}
