//! Node configuration.
//!
//! Loaded from a JSON file. Unknown options are rejected at startup; a
//! typo in a config key must fail loudly rather than silently fall back
//! to a default.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Exit code for a normal shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code for a configuration error.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code when the card is unavailable at startup.
pub const EXIT_CARD: i32 = 3;
/// Exit code when the UDP socket cannot be bound.
pub const EXIT_BIND: i32 = 4;

/// Recognized configuration options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// UDP port to bind.
    pub udp_port: u16,
    /// Address to bind.
    pub listen_ip: IpAddr,
    /// Handshake timeout before the first retransmission.
    pub handshake_timeout_seconds: f64,
    /// Base delay before a message is retransmitted.
    pub message_retry_seconds: f64,
    /// Idle time after which an Established session is suspended.
    pub idle_suspend_seconds: u64,
    /// PKCS#11 module for the card access layer.
    pub pkcs_module_path: Option<PathBuf>,
    /// Service name advertised to the discovery layer.
    pub discovery_service_name: String,
    /// Persistence location.
    pub db_path: Option<PathBuf>,
    /// Log file location.
    pub log_path: Option<PathBuf>,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: 6666,
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            handshake_timeout_seconds: 3.0,
            message_retry_seconds: 2.0,
            idle_suspend_seconds: 300,
            pkcs_module_path: None,
            discovery_service_name: "_cardwire._udp".to_string(),
            db_path: None,
            log_path: None,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&data)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(data).map_err(|e| ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.handshake_timeout_seconds.is_finite() || self.handshake_timeout_seconds <= 0.0 {
            return Err(ConfigError("handshake_timeout_seconds must be positive".into()));
        }
        if !self.message_retry_seconds.is_finite() || self.message_retry_seconds <= 0.0 {
            return Err(ConfigError("message_retry_seconds must be positive".into()));
        }
        if self.idle_suspend_seconds == 0 {
            return Err(ConfigError("idle_suspend_seconds must be positive".into()));
        }
        Ok(())
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout_seconds)
    }

    /// Message retry base delay as a duration.
    pub fn message_retry(&self) -> Duration {
        Duration::from_secs_f64(self.message_retry_seconds)
    }

    /// Idle-suspend threshold as a duration.
    pub fn idle_suspend(&self) -> Duration {
        Duration::from_secs(self.idle_suspend_seconds)
    }
}

/// Configuration load or validation failure. Maps to [`EXIT_CONFIG`].
#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
