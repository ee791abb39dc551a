// ============================
// live-relay-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Prefix for environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "LIVE_RELAY_";

/// Config file read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Placeholder substituted with the channel handle in the upstream URL.
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Live-event source settings
    pub upstream: UpstreamSettings,
    /// Per-connection settings
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Where and how the relay reaches the live-event source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// WebSocket URL template, `{channel}` is replaced with the handle
    pub url: String,
    /// Seconds to wait for the upstream handshake before giving up
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Envelopes buffered per browser connection before new ones are dropped
    pub outbound_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            upstream: UpstreamSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/live/{channel}".to_string(),
            connect_timeout_secs: 15,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
        }
    }
}

impl UpstreamSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Settings {
    /// Load settings from `relay.toml` (if present) and the environment
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from the given TOML file (if present) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(AppError::InvalidInput(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        if self.upstream.connect_timeout_secs == 0 {
            return Err(AppError::InvalidInput(
                "upstream.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if !self.upstream.url.contains(CHANNEL_PLACEHOLDER) {
            return Err(AppError::InvalidInput(format!(
                "upstream.url must contain {CHANNEL_PLACEHOLDER}"
            )));
        }
        // The bridge is a local sidecar; TLS is not compiled in
        if !self.upstream.url.starts_with("ws://") {
            return Err(AppError::InvalidInput(
                "upstream.url must use ws://".to_string(),
            ));
        }
        if self.session.outbound_buffer == 0 {
            return Err(AppError::InvalidInput(
                "session.outbound_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
