//! Configuration management for Remote Relay

mod agent;
mod broker;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig, BridgeConfig, FileLimits};
pub use broker::BrokerConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-relay")
}

/// Default path of the broker configuration file
pub fn default_broker_config_path() -> PathBuf {
    default_config_dir().join("broker.toml")
}

/// Default path of the agent configuration file
pub fn default_agent_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    // Write to a sibling file first so a crash never leaves a truncated config
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to replace config: {}", e)))?;

    Ok(())
}
