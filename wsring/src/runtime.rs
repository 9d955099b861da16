//! Process-level setup: the acceptor runtime and file descriptor limits.

use crate::config::{LimitsConfig, RuntimeConfig};
use anyhow::{Context, Result};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tokio::runtime::Runtime;

/// Build the tokio runtime that hosts the upgrade acceptor.
pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_name(config.thread_name.clone())
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .build()
        .context("building acceptor runtime")
}

/// Raise the soft RLIMIT_NOFILE towards the hard limit.
///
/// Returns the resulting soft limit. The limit is never lowered.
pub fn raise_nofile_limit(config: &LimitsConfig) -> Result<u64> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).context("reading RLIMIT_NOFILE")?;
    let target = match config.nofile_target {
        Some(target) => target.min(hard),
        None => hard,
    };
    if target <= soft {
        return Ok(soft);
    }
    setrlimit(Resource::RLIMIT_NOFILE, target, hard)
        .with_context(|| format!("raising RLIMIT_NOFILE from {} to {}", soft, target))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_never_lowers() {
        let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let config = LimitsConfig {
            raise_nofile: true,
            nofile_target: Some(64),
        };
        let limit = raise_nofile_limit(&config).unwrap();
        assert!(limit >= soft);
        let (after, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(after, limit);
    }

    #[test]
    fn test_create_runtime_from_defaults() {
        let config = RuntimeConfig {
            worker_threads: 1,
            ..RuntimeConfig::default()
        };
        let runtime = create_runtime(&config).unwrap();
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }
}
