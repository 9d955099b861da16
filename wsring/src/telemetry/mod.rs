//! Structured logging setup.
//!
//! Every component logs through `tracing` macros with structured fields
//! (`fd`, `conn_id`, `peer`, `bytes`). This module installs the subscriber:
//! an `EnvFilter` seeded from the configured level, so `RUST_LOG` still wins,
//! and a plain or JSON fmt layer.

use crate::config::LoggingConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(config.level.to_string())
            .map_err(|e| anyhow!("invalid log filter '{}': {}", config.level, e)),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line);
        registry
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("failed to install log subscriber: {}", e))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(config.enable_colors)
            .with_line_number(config.include_file_line)
            .with_file(config.include_file_line);
        registry
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("failed to install log subscriber: {}", e))?;
    }

    tracing::info!(
        level = %config.level,
        json = config.json_format,
        read_log_threshold = config.read_log_threshold,
        "Logging initialized"
    );
    Ok(())
}
