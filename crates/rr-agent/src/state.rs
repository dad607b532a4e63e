//! Agent state management

use std::path::PathBuf;

use tokio::sync::RwLock;

use rr_core::config::{self, AgentConfig};
use rr_core::ConfigError;
use rr_protocol::AgentInfo;

/// Global state for the agent daemon
pub struct AgentState {
    /// Configuration, rewritten once the broker pushes a credential
    config: RwLock<AgentConfig>,
    /// File the configuration is persisted to
    config_path: Option<PathBuf>,
}

impl AgentState {
    /// Create new agent state
    ///
    /// Without a `config_path`, credentials pushed by the broker are kept in
    /// memory only.
    pub fn new(config: AgentConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            config_path,
        }
    }

    /// Snapshot of the current configuration
    pub async fn config(&self) -> AgentConfig {
        self.config.read().await.clone()
    }

    /// Credential to present on the next `Register`
    pub async fn credential(&self) -> Option<String> {
        self.config.read().await.credential().map(str::to_string)
    }

    /// What the agent reports about itself
    pub async fn agent_info(&self) -> AgentInfo {
        let friendly_name = self.config.read().await.friendly_name.clone();
        local_agent_info(friendly_name)
    }

    /// Store the identity issued by the broker and persist it
    ///
    /// The in-memory credential is updated even when writing the file fails,
    /// so the next reconnect still uses the new token.
    pub async fn persist_credential(
        &self,
        agent_id: String,
        token: String,
    ) -> Result<(), ConfigError> {
        let snapshot = {
            let mut config = self.config.write().await;
            config.apply_credential(agent_id, token);
            config.clone()
        };

        match &self.config_path {
            Some(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || config::save_config(&path, &snapshot))
                    .await
                    .map_err(|e| ConfigError::Invalid(format!("Config writer failed: {}", e)))?
            }
            None => Ok(()),
        }
    }
}

/// Describe this machine and agent build
pub fn local_agent_info(friendly_name: Option<String>) -> AgentInfo {
    let mut info = AgentInfo::new(gethostname::gethostname().to_string_lossy().to_string());
    info.friendly_name = friendly_name;
    info.os_version = sysinfo::System::long_os_version();
    info.user_name = Some(whoami::username());
    info.agent_version = Some(env!("CARGO_PKG_VERSION").to_string());
    info
}
