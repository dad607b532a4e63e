//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Default port agents connect to
pub const DEFAULT_AGENT_PORT: u16 = 22240;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the agent listener binds to
    pub bind_address: String,

    /// Port of the caller-facing API (bound on localhost only)
    pub api_port: u16,

    /// Shared secret API clients must present, if set
    pub api_key: Option<String>,

    /// SQLite database holding identities, pairing tickets, and selections
    pub database_path: PathBuf,

    /// How long a dispatched command may wait for the agent's answer
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// How long a new connection has to send its `Register` frame
    #[serde(with = "duration_secs")]
    pub register_timeout: Duration,

    /// How often the stale-agent monitor runs
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// An agent silent for longer than this is disconnected
    #[serde(with = "duration_secs")]
    pub agent_timeout: Duration,

    /// Lifetime of a freshly generated pairing code
    #[serde(with = "duration_secs")]
    pub pairing_code_ttl: Duration,

    /// Maximum number of agents a single user may pair
    pub max_agents_per_user: u32,

    /// Maximum number of concurrent agent connections
    pub max_connections: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", DEFAULT_AGENT_PORT),
            api_port: 22241,
            api_key: None,
            database_path: super::default_config_dir().join("broker.db"),
            command_timeout: Duration::from_secs(120),
            register_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            agent_timeout: Duration::from_secs(90),
            pairing_code_ttl: Duration::from_secs(10 * 60),
            max_agents_per_user: 10,
            max_connections: None,
        }
    }
}

impl BrokerConfig {
    /// Get the API address (localhost:port)
    pub fn api_address(&self) -> String {
        format!("127.0.0.1:{}", self.api_port)
    }

    /// Check values that would make the broker misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "command_timeout must be greater than zero".to_string(),
            ));
        }
        if self.pairing_code_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "pairing_code_ttl must be greater than zero".to_string(),
            ));
        }
        if self.max_agents_per_user == 0 {
            return Err(ConfigError::Invalid(
                "max_agents_per_user must be at least 1".to_string(),
            ));
        }
        if self.agent_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "agent_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.agent_timeout, self.heartbeat_interval
            )));
        }
        if matches!(&self.api_key, Some(key) if key.trim().is_empty()) {
            return Err(ConfigError::Invalid("api_key must not be blank".to_string()));
        }
        Ok(())
    }
}
