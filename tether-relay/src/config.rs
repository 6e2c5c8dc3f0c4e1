//! Configuration for the relay service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::RelaySettings;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener addresses.
    pub network: NetworkConfig,
    /// Session limits and relay tuning.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration. One TCP port per channel, one shared UDP port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub screen_port: u16,
    pub control_port: u16,
    pub chat_port: u16,
    pub udp_port: u16,
    /// Run the datagram dispatcher.
    pub enable_udp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions allowed to wait for a viewer at once.
    pub max_sessions: usize,
    /// Reconnection grace window in milliseconds.
    pub grace_period_ms: u64,
    /// Longest accepted handshake line.
    pub max_handshake_bytes: usize,
    /// Read buffer per relay direction.
    pub relay_buffer_bytes: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            screen_port: 5000,
            control_port: 5001,
            chat_port: 5002,
            udp_port: 5003,
            enable_udp: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            grace_period_ms: 5000,
            max_handshake_bytes: 1024,
            relay_buffer_bytes: 8192,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Convert session settings into the core's `RelaySettings`.
    pub fn to_relay_settings(&self) -> RelaySettings {
        RelaySettings {
            max_sessions: self.session.max_sessions.max(1),
            grace_period: Duration::from_millis(self.session.grace_period_ms),
            max_handshake_bytes: self.session.max_handshake_bytes.clamp(64, u16::MAX as usize),
            relay_buffer_bytes: self.session.relay_buffer_bytes.clamp(512, 1024 * 1024),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
