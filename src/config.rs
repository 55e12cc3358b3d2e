//! # Configuration Management
//!
//! Centralized configuration for the gateway.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! Configuration is static for the life of the process. Call `validate_strict()` at
//! startup so that misconfiguration fails fast instead of surfacing at runtime.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Home peer the gateway registers with
pub const DEFAULT_HOME_PEER: Ipv6Addr =
    Ipv6Addr::new(0xfdc8, 0x70a6, 0x511c, 0x0000, 0x221a, 0x06ff, 0xfe03, 0xcaf6);

/// Default telemetry reporting period
pub const DEFAULT_REPORTING_INTERVAL: Duration = Duration::from_secs(60);

/// Default registration resource path
pub const DEFAULT_REGISTRATION_PATH: &str = "nh/lo";

/// Default telemetry resource path
pub const DEFAULT_REPORTING_PATH: &str = "nh/rss";

/// Main gateway configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GatewayConfig {
    /// Registration/telemetry session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Serial link configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| GatewayError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| GatewayError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| GatewayError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Unparseable values are reported rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MESH_GATEWAY_HOME_PEER") {
            config.session.home_peer_address = addr.parse().map_err(|e| {
                GatewayError::ConfigError(format!("Invalid MESH_GATEWAY_HOME_PEER '{addr}': {e}"))
            })?;
        }

        if let Ok(interval) = std::env::var("MESH_GATEWAY_REPORTING_INTERVAL_SECS") {
            let secs = interval.parse::<u64>().map_err(|e| {
                GatewayError::ConfigError(format!(
                    "Invalid MESH_GATEWAY_REPORTING_INTERVAL_SECS '{interval}': {e}"
                ))
            })?;
            config.session.reporting_interval = Duration::from_secs(secs);
        }

        if let Ok(path) = std::env::var("MESH_GATEWAY_REGISTRATION_PATH") {
            config.session.registration_path = path;
        }

        if let Ok(path) = std::env::var("MESH_GATEWAY_REPORTING_PATH") {
            config.session.reporting_path = path;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.serial.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Registration and telemetry session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// IPv6 address of the home peer
    pub home_peer_address: Ipv6Addr,

    /// UDP port of the home peer
    pub peer_port: u16,

    /// Period between telemetry reports
    #[serde(rename = "reporting_interval_secs", with = "duration_secs")]
    pub reporting_interval: Duration,

    /// CoAP path of the registration resource
    pub registration_path: String,

    /// CoAP path of the telemetry resource
    pub reporting_path: String,

    /// Delay before an unanswered or failed hello is re-sent
    #[serde(rename = "registration_retry_secs", with = "duration_secs")]
    pub registration_retry: Duration,

    /// How long a telemetry report may wait for its reply
    #[serde(rename = "reply_timeout_secs", with = "duration_secs")]
    pub reply_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            home_peer_address: DEFAULT_HOME_PEER,
            peer_port: crate::core::packet::COAP_DEFAULT_PORT,
            reporting_interval: DEFAULT_REPORTING_INTERVAL,
            registration_path: String::from(DEFAULT_REGISTRATION_PATH),
            reporting_path: String::from(DEFAULT_REPORTING_PATH),
            registration_retry: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Home peer address as raw bytes
    pub fn home_peer_bytes(&self) -> [u8; 16] {
        self.home_peer_address.octets()
    }

    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let addr = self.home_peer_address;
        if addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() {
            errors.push(format!(
                "Home peer address must be a unicast address, got '{addr}'"
            ));
        }

        if self.peer_port == 0 {
            errors.push("Peer port cannot be 0".to_string());
        }

        if self.reporting_interval.as_secs() < 1 {
            errors.push("Reporting interval too short (minimum: 1s)".to_string());
        } else if self.reporting_interval.as_secs() > 86_400 {
            errors.push("Reporting interval too long (maximum: 1 day)".to_string());
        }

        errors.extend(validate_path("Registration path", &self.registration_path));
        errors.extend(validate_path("Reporting path", &self.reporting_path));

        if self.registration_retry.as_secs() < 1 {
            errors.push("Registration retry too short (minimum: 1s)".to_string());
        }

        if self.reply_timeout.as_secs() < 1 {
            errors.push("Reply timeout too short (minimum: 1s)".to_string());
        }

        errors
    }
}

fn validate_path(label: &str, path: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        errors.push(format!("{label} cannot be empty"));
    }
    for segment in segments {
        if segment.len() > 255 {
            errors.push(format!(
                "{label} segment too long: {} bytes (maximum: 255)",
                segment.len()
            ));
        }
    }
    errors
}

/// Serial link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Largest escaped frame accepted from or sent to the serial link, flags included
    pub max_frame_size: usize,

    /// Capacity of the outbound packet queue
    pub outbound_queue: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::core::codec::DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: 64,
        }
    }
}

impl SerialConfig {
    /// Validate serial configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 4 {
            errors.push("Max frame size too small (minimum: 4 bytes)".to_string());
        } else if self.max_frame_size > 64 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: 64 KB)",
                self.max_frame_size
            ));
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue must hold at least one packet".to_string());
        }

        errors
    }
}

/// Where and how the gateway writes its logs.
///
/// Console and file output are independent. With both enabled, every event goes to
/// both. Omitted keys keep their defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Name recorded on the startup log line
    pub service_name: String,

    /// Filter level used when `RUST_LOG` is unset
    #[serde(with = "log_level_serde")]
    pub level: Level,

    /// Write events to stdout
    pub console: bool,

    /// Append events to this file
    pub file: Option<PathBuf>,

    /// One JSON object per event instead of plain text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("mesh-gateway"),
            level: Level::INFO,
            console: true,
            file: None,
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Longest accepted `service_name`, in bytes
    pub const MAX_SERVICE_NAME_LEN: usize = 64;

    /// Check that the configured outputs can be opened.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.service_name.is_empty() {
            errors.push("Logging service name is empty".to_string());
        } else if self.service_name.len() > Self::MAX_SERVICE_NAME_LEN {
            errors.push(format!(
                "Logging service name is {} bytes; the limit is {}",
                self.service_name.len(),
                Self::MAX_SERVICE_NAME_LEN
            ));
        }

        if let Some(dir) = self.file.as_deref().and_then(Path::parent) {
            if !dir.as_os_str().is_empty() && !dir.is_dir() {
                errors.push(format!("Log directory {} is missing", dir.display()));
            }
        }

        if !self.console && self.file.is_none() {
            errors.push("Logging has no output: enable console or set a file".to_string());
        }

        errors
    }
}

/// Durations are written as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
