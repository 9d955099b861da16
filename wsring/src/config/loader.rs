//! Configuration loading and parsing.
//!
//! Handles loading configuration from files, environment variables, and
//! command-line arguments, with proper precedence handling.

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use config::Config as ConfigLoader;
use std::path::Path;

use super::ServerConfig;

/// Command-line interface for the server.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "wsring.toml")]
    pub config: String,

    /// Host address to bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Load and parse server configuration.
///
/// Precedence, lowest first:
/// 1. Default values
/// 2. Configuration file
/// 3. Environment variables (`WSRING_` prefix)
/// 4. Command-line arguments
///
/// Exits the process after `--print-default-config` or `--validate`.
pub fn load_config() -> Result<ServerConfig> {
    let matches = CliArgs::command().get_matches();
    let cli =
        CliArgs::from_arg_matches(&matches).context("Failed to parse command-line arguments")?;

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = resolve_config(&cli, None)?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Build the effective configuration for `cli`.
///
/// `env` replaces the process environment when given.
pub fn resolve_config(
    cli: &CliArgs,
    env: Option<config::Map<String, String>>,
) -> Result<ServerConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config, env)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;
    Ok(config)
}

/// Load configuration from a TOML file. A missing file yields defaults.
pub fn load_config_file(path: &str) -> Result<ServerConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(ServerConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Variables are prefixed with `WSRING_` and use `__` between sections:
/// - `WSRING_NETWORK__PORT=9000`
/// - `WSRING_LOGGING__LEVEL=debug`
/// - `WSRING_NETIO__READ_DEADLINE_MS=30000`
fn apply_env_overrides(
    config: &mut ServerConfig,
    env: Option<config::Map<String, String>>,
) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(
            config::Environment::with_prefix("WSRING")
                .prefix_separator("_")
                .separator("__")
                .source(env),
        )
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(host) = env_config.get_string("network.host") {
        config.network.host = host;
    }
    if let Ok(port) = env_config.get_int("network.port") {
        config.network.port =
            u16::try_from(port).with_context(|| format!("WSRING_NETWORK__PORT out of range: {}", port))?;
    }
    if let Ok(level) = env_config.get_string("logging.level") {
        match level.parse() {
            Ok(parsed) => config.logging.level = parsed,
            Err(e) => tracing::warn!(error = %e, "Ignoring WSRING_LOGGING__LEVEL"),
        }
    }
    if let Ok(json) = env_config.get_bool("logging.json_format") {
        config.logging.json_format = json;
    }
    if let Ok(mode) = env_config.get_string("netio.readiness_mode") {
        config.netio.readiness_mode = match mode.to_lowercase().as_str() {
            "oneshot" => crate::netio::ReadinessMode::Oneshot,
            "edge" => crate::netio::ReadinessMode::Edge,
            "ring" => crate::netio::ReadinessMode::Ring,
            other => anyhow::bail!("Invalid WSRING_NETIO__READINESS_MODE: {}", other),
        };
    }
    if let Ok(ms) = env_config.get_int("netio.read_deadline_ms") {
        config.netio.read_deadline_ms = if ms > 0 { Some(ms as u64) } else { None };
    }
    if let Ok(capacity) = env_config.get_int("netio.buffer_pool.capacity") {
        config.netio.buffer_pool.capacity = capacity.max(0) as usize;
    }
    if let Ok(size) = env_config.get_int("netio.buffer_pool.buffer_size") {
        config.netio.buffer_pool.buffer_size = size.max(0) as usize;
    }
    if let Ok(carry) = env_config.get_bool("decoder.carry_partial") {
        config.decoder.carry_partial = carry;
    }

    Ok(())
}

/// Apply command-line argument overrides.
fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    if let Some(ref host) = cli.host {
        config.network.host = host.clone();
    }

    if let Some(port) = cli.port {
        config.network.port = port;
    }

    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    let default_config = ServerConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
