use crate::config::{ConfigErrors, HpcConfig};
use once_cell::sync::Lazy;
use std::env;
use tracing::{error, warn};

/// hostname of this node, resolved once
pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname: {error}");

        "unknown".to_owned()
    }
});

/// (worker_index, worker_count) of this array task, `None` outside of an array job
pub fn worker_from_env(hpc: &HpcConfig) -> Result<Option<(usize, usize)>, ConfigErrors> {
    let index = env::var(&hpc.task_id_var).ok();
    let count = env::var(&hpc.task_count_var).ok();

    if index.is_none() || count.is_none() {
        warn!(
            task_id_var = hpc.task_id_var.as_str(),
            task_count_var = hpc.task_count_var.as_str(),
            "Array task environment is not set, falling back to the local pool"
        );
    }

    parse_worker(index.as_deref(), count.as_deref(), hpc.zero_based)
}

pub fn parse_worker(
    index: Option<&str>,
    count: Option<&str>,
    zero_based: bool,
) -> Result<Option<(usize, usize)>, ConfigErrors> {
    let (Some(index), Some(count)) = (index, count) else {
        return Ok(None);
    };

    let parse = |name: &str, value: &str| {
        value.trim().parse::<usize>().map_err(|_| {
            ConfigErrors::WorkerEnvironment(format!("{name} '{value}' is not a natural number"))
        })
    };

    let index = parse("task id", index)? + usize::from(zero_based);
    let count = parse("task count", count)?;

    if count == 0 || index == 0 || index > count {
        return Err(ConfigErrors::WorkerEnvironment(format!(
            "task id {index} is not within 1..={count}"
        )));
    }

    Ok(Some((index, count)))
}
