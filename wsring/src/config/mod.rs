//! Server configuration.
//!
//! Settings come from, in increasing precedence: built-in defaults, a TOML
//! file, `WSRING_` environment variables and command-line flags.
//!
//! # Example
//!
//! ```toml
//! [network]
//! host = "0.0.0.0"
//! port = 8000
//!
//! [logging]
//! level = "info"
//! read_log_threshold = 100
//!
//! [netio]
//! readiness_mode = "oneshot"   # or "edge", or "ring" for no epoll
//! read_deadline_ms = 30000
//!
//! [netio.buffer_pool]
//! capacity = 1000
//! buffer_size = 4096
//!
//! [decoder]
//! interest = "text"
//! carry_partial = true
//! ```

pub mod global;
pub mod loader;
pub mod validation;

pub use global::{
    DecoderSettings, InterestSetting, LimitsConfig, LogLevel, LoggingConfig, NetworkConfig,
    RuntimeConfig, UpgradeConfig,
};
pub use loader::{load_config, CliArgs};

use crate::netio::NetIoConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub limits: LimitsConfig,
    pub upgrade: UpgradeConfig,
    pub netio: NetIoConfig,
    pub decoder: DecoderSettings,
}

impl ServerConfig {
    /// Validate every section, then the cross-section constraints.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let sections = [
            self.network.validate(),
            self.runtime.validate(),
            self.limits.validate(),
            self.upgrade.validate(),
            self.netio.validate(),
            self.decoder.validate(),
        ];
        for result in sections {
            if let Err(e) = result {
                errors.extend(e);
            }
        }

        if let Err(e) = validation::validate_resource_limits(self) {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests;
