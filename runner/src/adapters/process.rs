use super::{AdapterError, ModelRun, RunContext};
use crate::ledger::Stage;
use chrono::Utc;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// stdout and stderr of every attempt are appended here
pub const EXECUTION_LOG: &str = "execution.log";

/// command line of the model, the configured arguments win over the adapter defaults
pub fn arguments(context: &RunContext<'_>, defaults: &[&str], experiment: &Path) -> Vec<String> {
    let experiment = experiment
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let working_dir = context.working_dir.to_string_lossy();

    match &context.model.arguments {
        Some(arguments) => arguments.clone(),
        None => defaults.iter().map(|arg| arg.to_string()).collect(),
    }
    .into_iter()
    .map(|arg| {
        arg.replace("{experiment}", &experiment)
            .replace("{working_dir}", &working_dir)
    })
    .collect()
}

fn open_log(path: &Path) -> Result<File, AdapterError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|error| AdapterError::setup(Stage::Model, format!("failed to open {path:?}: {error}")))
}

fn reap(child: &mut Child) {
    if let Err(error) = child.wait() {
        error!(error = ?error, pid = child.id(), "Failed to reap model");
    }
}

/// run the model executable inside the working directory under the context's timeout
///
/// The child leads its own process group, on timeout the whole group is killed.
pub fn run(context: &RunContext<'_>, defaults: &[&str], experiment: &Path) -> Result<ModelRun, AdapterError> {
    let executable = &context.model.executable;
    let arguments = arguments(context, defaults, experiment);
    let log_path = context.working_dir.join(EXECUTION_LOG);
    let mut log = open_log(&log_path)?;

    let clone_log = |log: &File| {
        log.try_clone()
            .map_err(|error| AdapterError::setup(Stage::Model, format!("failed to share {log_path:?}: {error}")))
    };

    // best effort
    if let Err(error) = writeln!(
        log,
        "==> {} {} {}",
        Utc::now().to_rfc3339(),
        executable.to_string_lossy(),
        arguments.join(" ")
    ) {
        warn!(error = ?error, "Failed to write execution log header");
    }

    let start = Instant::now();
    let mut child = Command::new(executable)
        .args(&arguments)
        .current_dir(context.working_dir)
        .stdin(Stdio::null())
        .stdout(clone_log(&log)?)
        .stderr(clone_log(&log)?)
        .process_group(0)
        .spawn()
        .map_err(|source| AdapterError::Spawn {
            executable: executable.clone(),
            source,
        })?;

    debug!(pid = child.id(), timeout = ?context.timeout, "Spawned model");

    let status = match child.wait_timeout(context.timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(
                pid = child.id(),
                timeout = ?context.timeout,
                "Model exceeded its timeout, killing the process group"
            );

            if let Err(error) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
                error!(error = ?error, "Failed to kill process group, killing the child only");
                if let Err(error) = child.kill() {
                    error!(error = ?error, pid = child.id(), "Failed to kill model");
                }
            }
            reap(&mut child);
            if let Err(error) = writeln!(log, "<== killed after {:?}", context.timeout) {
                warn!(error = ?error, "Failed to write execution log footer");
            }

            return Err(AdapterError::Timeout(context.timeout));
        }
        Err(source) => {
            if let Err(error) = child.kill() {
                error!(error = ?error, pid = child.id(), "Failed to kill model");
            }
            reap(&mut child);

            return Err(AdapterError::Spawn {
                executable: executable.clone(),
                source,
            });
        }
    };

    let elapsed = start.elapsed();
    if let Err(error) = writeln!(log, "<== {status} after {elapsed:?}") {
        warn!(error = ?error, "Failed to write execution log footer");
    }

    if status.success() {
        info!(elapsed = ?elapsed, "Model finished");

        Ok(ModelRun {
            exit_code: status.code(),
            elapsed,
        })
    } else {
        Err(AdapterError::Exit {
            code: status.code(),
            log: log_path,
        })
    }
}
