use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::WireMode;

/// Hub settings, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the listener binds.
    pub bind: SocketAddr,
    /// Registrations beyond this count are refused.
    pub max_sessions: usize,
    /// How long one accept call may block before the stop flag is polled.
    pub accept_poll_interval_ms: u64,
    /// Time allowed for an agent to send its identity.
    pub handshake_timeout_ms: u64,
    /// Maximum identity length in bytes.
    pub identity_limit: usize,
    /// Read size for raw-mode output chunks.
    pub read_buffer: usize,
    pub wire: WireMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1234)),
            max_sessions: 256,
            accept_poll_interval_ms: 2000,
            handshake_timeout_ms: 5000,
            identity_limit: 2048,
            read_buffer: 4096,
            wire: WireMode::Framed,
        }
    }
}

impl HubConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject values that would stall or break the hub.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("accept_poll_interval_ms must be positive".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be positive".into()));
        }
        if self.identity_limit == 0 {
            return Err(ConfigError::Invalid("identity_limit must be positive".into()));
        }
        if self.read_buffer == 0 {
            return Err(ConfigError::Invalid("read_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}
