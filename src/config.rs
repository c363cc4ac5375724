//! # Configuration Management
//!
//! Centralized configuration for the peer protocol engine.
//!
//! This module provides structured configuration for listeners and
//! connections, including heartbeat timing, framing parameters, and the
//! request-id range.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Validation
//! `validate()` returns every problem found; `validate_strict()` folds them
//! into a single `ConfigError`. The heartbeat timeout has a hard floor of
//! two seconds; values below it are clamped rather than rejected, matching
//! the connection constructor.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Default listening port for peer listeners
pub const DEFAULT_PORT: u16 = 4205;

/// Default width of the frame length header in bytes
pub const DEFAULT_MAX_BYTES: usize = 4;

/// Smallest permitted heartbeat timeout
pub const MIN_TIMEOUT_SECS: u64 = 2;

/// Default request-id range (half-open)
pub const DEFAULT_ID_RANGE: (u32, u32) = (100, 999);

/// Per-connection protocol parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Heartbeat interval and lease time in seconds (floor: 2)
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Raw-read chunk size in bytes
    #[serde(default = "defaults::packet_size")]
    pub packet_size: usize,

    /// Loop tick interval in milliseconds
    #[serde(default = "defaults::tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Initial width of the frame length header in bytes (1..=8)
    #[serde(default = "defaults::max_bytes")]
    pub max_bytes: usize,

    /// First request id handed out (inclusive)
    #[serde(default = "defaults::id_start")]
    pub id_start: u32,

    /// End of the request-id range (exclusive)
    #[serde(default = "defaults::id_end")]
    pub id_end: u32,

    /// Number of callback workers per connection
    #[serde(default = "defaults::workers")]
    pub workers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            packet_size: defaults::packet_size(),
            tick_interval_ms: defaults::tick_interval_ms(),
            max_bytes: defaults::max_bytes(),
            id_start: defaults::id_start(),
            id_end: defaults::id_end(),
            workers: defaults::workers(),
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat timeout with the two-second floor applied
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(MIN_TIMEOUT_SECS))
    }

    /// Loop tick interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.packet_size == 0 {
            errors.push("packet_size must be greater than zero".to_string());
        }
        if self.tick_interval_ms == 0 {
            errors.push("tick_interval_ms must be greater than zero".to_string());
        }
        if !(1..=8).contains(&self.max_bytes) {
            errors.push(format!(
                "max_bytes must be within 1..=8, got {}",
                self.max_bytes
            ));
        }
        if self.id_start >= self.id_end {
            errors.push(format!(
                "id range [{}, {}) is empty",
                self.id_start, self.id_end
            ));
        }
        if self.workers == 0 {
            errors.push("workers must be greater than zero".to_string());
        }

        errors
    }
}

/// Listener-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Address to bind
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,

    /// Port to listen on (0 picks an ephemeral port)
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Parameters applied to every accepted connection
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::bind_address(),
            port: defaults::port(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEER_PROTOCOL_BIND_ADDRESS") {
            config.bind_address = addr;
        }

        if let Ok(port) = std::env::var("PEER_PROTOCOL_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.port = val;
            }
        }

        if let Ok(timeout) = std::env::var("PEER_PROTOCOL_TIMEOUT_SECS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.timeout_secs = val;
            }
        }

        if let Ok(tick) = std::env::var("PEER_PROTOCOL_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.connection.tick_interval_ms = val;
            }
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("bind_address must not be empty".to_string());
        }

        errors.extend(self.connection.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

mod defaults {
    pub fn timeout_secs() -> u64 {
        10
    }
    pub fn packet_size() -> usize {
        1024
    }
    pub fn tick_interval_ms() -> u64 {
        50
    }
    pub fn max_bytes() -> usize {
        super::DEFAULT_MAX_BYTES
    }
    pub fn id_start() -> u32 {
        super::DEFAULT_ID_RANGE.0
    }
    pub fn id_end() -> u32 {
        super::DEFAULT_ID_RANGE.1
    }
    pub fn workers() -> usize {
        crate::utils::workers::DEFAULT_WORKERS
    }
    pub fn bind_address() -> String {
        "0.0.0.0".to_string()
    }
    pub fn port() -> u16 {
        super::DEFAULT_PORT
    }
}
