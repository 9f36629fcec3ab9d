//! Server configuration
//!
//! Handles parsing and management of `rdev.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// File name searched for by [`ServerConfig::find_and_load`]
pub const CONFIG_FILE: &str = "rdev.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching rdev.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ListenConfig,

    /// Device selection
    #[serde(default)]
    pub device: DeviceConfig,

    /// Payload ceilings
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl ServerConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `host:port` string for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Set TCP_NODELAY on accepted connections
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// SO_REUSEADDR on the listener
    #[serde(default = "default_true")]
    pub reuse_address: bool,

    /// SO_REUSEPORT on the listener where the platform has it
    #[serde(default = "default_true")]
    pub reuse_port: bool,

    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Serve each connection on its own thread
    #[serde(default)]
    pub concurrent: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_true() -> bool {
    true
}

fn default_backlog() -> i32 {
    128
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            nodelay: true,
            reuse_address: true,
            reuse_port: true,
            backlog: default_backlog(),
            concurrent: false,
        }
    }
}

/// Device selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device every new session is bound to
    #[serde(default = "default_device")]
    pub default: String,
}

fn default_device() -> String {
    "CPU".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default: default_device(),
        }
    }
}

/// Payload ceilings enforced by every session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Structured block ceiling (device name, alloc, free, load header)
    #[serde(default = "default_block_bytes")]
    pub block_bytes: usize,

    /// Run block ceiling
    #[serde(default = "default_run_block_bytes")]
    pub run_block_bytes: usize,

    /// Allocation size, compile source and load binary ceiling
    #[serde(default = "default_transfer_bytes")]
    pub transfer_bytes: u64,
}

fn default_block_bytes() -> usize {
    1024
}

fn default_run_block_bytes() -> usize {
    4096
}

fn default_transfer_bytes() -> u64 {
    1 << 30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            block_bytes: default_block_bytes(),
            run_block_bytes: default_run_block_bytes(),
            transfer_bytes: default_transfer_bytes(),
        }
    }
}
