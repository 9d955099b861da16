//! Server-wide configuration sections.
//!
//! Network binding, the acceptor runtime, logging, process limits, the
//! upgrade handshake and frame decoding.

use serde::{Deserialize, Serialize};
use wsring_proto::decoder::DEFAULT_MAX_MESSAGE_SIZE;
use wsring_proto::{DecoderConfig, Interest, Role, MAX_HEADER_LEN};

/// Network binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address to bind the upgrade listener to.
    ///
    /// **Default:** `"0.0.0.0"`
    pub host: String,

    /// TCP port for WebSocket upgrades.
    ///
    /// **Default:** `8000`
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("Invalid host address: {}", self.host));
        }

        if self.port == 0 {
            eprintln!("Warning: port=0 will bind to a random port assigned by the OS");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn bind_addr(&self) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
        let ip: std::net::IpAddr = self.host.parse()?;
        Ok(std::net::SocketAddr::new(ip, self.port))
    }
}

/// Tokio runtime hosting the upgrade acceptor and signal handling.
///
/// The read path runs on its own native threads and does not use this
/// runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// **Default:** number of CPU cores, capped at 4
    pub worker_threads: usize,

    /// **Default:** 64
    pub max_blocking_threads: usize,

    /// **Default:** `"wsring-acceptor"`
    pub thread_name: String,

    /// **Default:** 2 MB
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(1, 4),
            max_blocking_threads: 64,
            thread_name: "wsring-acceptor".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker_threads == 0 {
            errors.push("worker_threads must be > 0".to_string());
        }

        if self.worker_threads > 1024 {
            errors.push("worker_threads is unreasonably high (> 1024)".to_string());
        }

        if self.max_blocking_threads == 0 {
            errors.push("max_blocking_threads must be > 0".to_string());
        }

        if self.thread_stack_size < 128 * 1024 {
            errors.push("thread_stack_size too small (< 128 KB)".to_string());
        }

        if self.thread_stack_size > 64 * 1024 * 1024 {
            errors.push("thread_stack_size too large (> 64 MB)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// **Default:** `Info`
    pub level: LogLevel,

    /// Emit one JSON object per event.
    ///
    /// **Default:** `false`
    pub json_format: bool,

    /// **Default:** `true`
    pub enable_colors: bool,

    /// **Default:** `false`
    pub include_file_line: bool,

    /// Per-message events are logged at info while fewer connections than
    /// this are registered, and at debug once the server is busier.
    ///
    /// **Default:** `100`
    pub read_log_threshold: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            enable_colors: true,
            include_file_line: false,
            read_log_threshold: 100,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Process resource limits applied before accepting connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Raise the soft RLIMIT_NOFILE to the hard limit at startup.
    ///
    /// **Default:** `true`
    pub raise_nofile: bool,

    /// Stop at this value instead of the hard limit.
    pub nofile_target: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            raise_nofile: true,
            nofile_target: None,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        match self.nofile_target {
            Some(target) if target < 64 => Err(vec![format!(
                "limits.nofile_target too small: {} (min 64)",
                target
            )]),
            _ => Ok(()),
        }
    }
}

/// HTTP upgrade handshake limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Give up on a client that has not sent a full request head in time.
    ///
    /// **Default:** `5000`
    pub handshake_timeout_ms: u64,

    /// Largest accepted request head.
    ///
    /// **Default:** `8192`
    pub max_request_bytes: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5000,
            max_request_bytes: 8192,
        }
    }
}

impl UpgradeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.handshake_timeout_ms == 0 {
            errors.push("upgrade.handshake_timeout_ms must be > 0".to_string());
        }

        if self.max_request_bytes < 256 {
            errors.push(format!(
                "upgrade.max_request_bytes too small: {} (min 256)",
                self.max_request_bytes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Which data messages are delivered to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterestSetting {
    #[default]
    Text,
    Binary,
    /// Text and binary.
    Any,
}

impl From<InterestSetting> for Interest {
    fn from(setting: InterestSetting) -> Self {
        match setting {
            InterestSetting::Text => Interest::Text,
            InterestSetting::Binary => Interest::Binary,
            InterestSetting::Any => Interest::Data,
        }
    }
}

/// Frame decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// **Default:** `text`
    pub interest: InterestSetting,

    /// Reject text messages that are not valid UTF-8.
    ///
    /// **Default:** `true`
    pub check_utf8: bool,

    /// Largest frame payload or reassembled message.
    ///
    /// **Default:** 1 MiB
    pub max_message_size: usize,

    /// Keep an incomplete trailing frame and prepend it to the next read.
    /// When off, a read that holds no complete message closes the
    /// connection.
    ///
    /// **Default:** `true`
    pub carry_partial: bool,

    /// Largest carried tail per connection.
    ///
    /// **Default:** `max_message_size` plus one frame header
    pub max_pending_bytes: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            interest: InterestSetting::Text,
            check_utf8: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            carry_partial: true,
            max_pending_bytes: DEFAULT_MAX_MESSAGE_SIZE + MAX_HEADER_LEN,
        }
    }
}

impl DecoderSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("decoder.max_message_size must be > 0".to_string());
        }

        if self.carry_partial && self.max_pending_bytes < MAX_HEADER_LEN {
            errors.push(format!(
                "decoder.max_pending_bytes must hold at least one frame header ({} bytes)",
                MAX_HEADER_LEN
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Decoder settings for the server side of a connection.
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            role: Role::Server,
            interest: self.interest.into(),
            check_utf8: self.check_utf8,
            max_message_size: self.max_message_size,
        }
    }
}
