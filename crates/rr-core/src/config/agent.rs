//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::broker::DEFAULT_AGENT_PORT;
use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Configuration for the remote agent
///
/// The agent rewrites this file once after pairing: `agent_id` and
/// `agent_token` are filled in and `pairing_code` is cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker address (`host:port`)
    pub broker_address: String,

    /// Identity assigned by the broker after pairing
    pub agent_id: Option<String>,

    /// Durable credential issued by the broker after pairing
    pub agent_token: Option<String>,

    /// One-time pairing code, used only while no token is stored
    pub pairing_code: Option<String>,

    /// Display name reported to the broker
    pub friendly_name: Option<String>,

    /// Interval between heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// How long a shell command (`cmd`, `power_shell`) may run
    #[serde(with = "duration_secs")]
    pub shell_timeout: Duration,

    /// Size limits for file commands
    pub files: FileLimits,

    /// Session bridge settings
    pub bridge: BridgeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_address: format!("localhost:{}", DEFAULT_AGENT_PORT),
            agent_id: None,
            agent_token: None,
            pairing_code: None,
            friendly_name: None,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            shell_timeout: Duration::from_secs(60),
            files: FileLimits::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// The credential to present on the next `Register`
    ///
    /// A stored token always wins over a pairing code.
    pub fn credential(&self) -> Option<&str> {
        let non_blank = |v: &&String| !v.trim().is_empty();
        self.agent_token
            .as_ref()
            .filter(non_blank)
            .or_else(|| self.pairing_code.as_ref().filter(non_blank))
            .map(|v| v.trim())
    }

    /// Whether the agent already holds a durable identity
    pub fn is_paired(&self) -> bool {
        matches!(&self.agent_token, Some(t) if !t.trim().is_empty())
    }

    /// Record the identity pushed by the broker after pairing
    pub fn apply_credential(&mut self, agent_id: String, token: String) {
        self.agent_id = Some(agent_id);
        self.agent_token = Some(token);
        self.pairing_code = None;
    }

    /// Check values that would make the agent misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.trim().is_empty() {
            return Err(ConfigError::MissingField("broker_address".to_string()));
        }
        if self.credential().is_none() {
            return Err(ConfigError::MissingField(
                "agent_token or pairing_code".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Size limits applied by the file commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLimits {
    /// Largest file `file_download` will send
    pub max_download_bytes: u64,
    /// Characters returned by `file_preview`
    pub preview_max_chars: usize,
    /// Bytes inspected to decide whether a file is binary
    pub binary_probe_bytes: usize,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_download_bytes: 45 * 1024 * 1024,
            preview_max_chars: 4000,
            binary_probe_bytes: 8000,
        }
    }
}

/// Session bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Force the bridge on or off; detected from the process session when unset
    pub enabled: Option<bool>,

    /// Directory for staged wrapper scripts and exit-code files
    pub staging_dir: PathBuf,

    /// How long a bridged job may run
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,

    /// Extra time allowed for the scheduler to start the job
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,

    /// Interval between checks for the exit-code file
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            staging_dir: default_staging_dir(),
            job_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(300),
        }
    }
}

/// Machine-wide location the interactive user can also read and write
fn default_staging_dir() -> PathBuf {
    #[cfg(windows)]
    let base = std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));

    #[cfg(not(windows))]
    let base = std::env::temp_dir();

    base.join("RemoteRelay").join("temp")
}
