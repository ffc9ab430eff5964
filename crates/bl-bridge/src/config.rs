//! Bridge configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hub::DEFAULT_SUBSCRIBER_BUFFER;
use crate::mailbox::DEFAULT_COMMAND_CAPACITY;

/// Bridge configuration, loadable from TOML. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bind address for the HTTP API
    pub http_bind: String,
    /// Bind address for the device WebSocket listener
    pub device_bind: String,
    /// Commands that may wait for the device before callers are turned away
    pub command_capacity: usize,
    /// Per-subscriber buffer of connectivity events
    pub subscriber_buffer: usize,
    /// Upper bound on one HTTP command call, queueing included
    pub request_timeout_secs: u64,
    /// How long the device may take to answer one command
    pub reply_timeout_secs: u64,
    /// Largest firmware upload accepted by `/bl/flash`
    pub max_upload_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:3000".to_string(),
            device_bind: "0.0.0.0:8080".to_string(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            request_timeout_secs: 30,
            reply_timeout_secs: 10,
            max_upload_bytes: 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: BridgeConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_capacity == 0 {
            return Err(ConfigError::Invalid("command_capacity must be at least 1".into()));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid("subscriber_buffer must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 || self.reply_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least one second".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("max_upload_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Set the HTTP bind address
    pub fn with_http_bind(mut self, bind: impl Into<String>) -> Self {
        self.http_bind = bind.into();
        self
    }

    /// Set the device bind address
    pub fn with_device_bind(mut self, bind: impl Into<String>) -> Self {
        self.device_bind = bind.into();
        self
    }
}
