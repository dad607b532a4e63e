//! Command dispatch
//!
//! The only path from callers to agents. Every command goes through the
//! routing gate first; routing failures return without touching the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rr_core::api::{
    CommandResult, DeviceInfo, DispatchFailure, PairingCodeInfo, SelectionOutcome,
};
use rr_core::{AgentId, UserId};
use rr_protocol::CommandType;

use crate::correlator::{CommandRequest, CorrelationError, Correlator};
use crate::identity::{IdentityService, PairingError};
use crate::registry::ConnectionRegistry;
use crate::routing::{RoutingError, RoutingGate};
use crate::store::{AgentRecord, BrokerStore, StoreError};

/// Why a device could not be renamed
#[derive(Debug, thiserror::Error)]
pub enum RenameError {
    #[error("device not found")]
    NotFound,

    #[error("device belongs to another user")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Facade over routing, correlation, and device management
pub struct CommandDispatcher {
    store: BrokerStore,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<Correlator>,
    identity: Arc<IdentityService>,
    routing: RoutingGate,
    command_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        store: BrokerStore,
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<Correlator>,
        identity: Arc<IdentityService>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            routing: RoutingGate::new(store.clone(), registry.clone()),
            store,
            registry,
            correlator,
            identity,
            command_timeout,
        }
    }

    /// Run a command on the device `user` has selected
    ///
    /// Never fails: routing and correlation problems come back as a result
    /// with `failure` set. An agent's own answer is returned unmodified.
    pub async fn execute(
        &self,
        user: UserId,
        command_type: CommandType,
        arguments: Option<String>,
        parameters: HashMap<String, String>,
    ) -> CommandResult {
        let target = match self.routing.resolve_target(user).await {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("Not dispatching {} for user {}: {}", command_type, user, e);
                return routing_failure(e);
            }
        };

        tracing::info!(
            "Dispatching {} for user {} to {}",
            command_type,
            user,
            target.agent_id
        );

        let request = CommandRequest {
            command_type,
            arguments,
            parameters,
        };

        match self
            .correlator
            .send_and_await(&target.handle, request, self.command_timeout)
            .await
        {
            Ok(response) => CommandResult::from(response),
            Err(e) => correlation_failure(e, &target.machine_name),
        }
    }

    /// Devices owned by `user`, with live status from the registry
    pub async fn list_devices(&self, user: UserId) -> Result<Vec<DeviceInfo>, StoreError> {
        let records = self.store.list_agents_for_owner(user).await?;
        let selected = self.store.get_selection(user).await?.map(|s| s.agent_id);

        Ok(records
            .iter()
            .map(|record| self.device_info(record, selected.as_deref()))
            .collect())
    }

    /// Make `agent_id` the target of `user`'s future commands
    pub async fn select_device(
        &self,
        user: UserId,
        agent_id: &AgentId,
    ) -> Result<SelectionOutcome, StoreError> {
        let Some(record) = self.store.get_agent(agent_id.as_str()).await? else {
            return Ok(SelectionOutcome::NotFound);
        };
        if record.owner() != user {
            tracing::warn!("User {} tried to select agent {} they do not own", user, agent_id);
            return Ok(SelectionOutcome::Forbidden);
        }

        self.store.upsert_selection(user, agent_id.as_str()).await?;
        tracing::info!("User {} selected {}", user, agent_id);
        Ok(SelectionOutcome::Selected)
    }

    /// The device `user` currently targets, if it still exists and is theirs
    pub async fn selected_device(&self, user: UserId) -> Result<Option<DeviceInfo>, StoreError> {
        let Some(selection) = self.store.get_selection(user).await? else {
            return Ok(None);
        };
        let device = self
            .store
            .get_agent(&selection.agent_id)
            .await?
            .filter(|record| record.owner() == user)
            .map(|record| self.device_info(&record, Some(&selection.agent_id)));
        Ok(device)
    }

    /// Issue a pairing code for `user`
    pub async fn generate_pairing_code(
        &self,
        user: UserId,
    ) -> Result<PairingCodeInfo, PairingError> {
        self.identity.create_pairing_code(user).await
    }

    /// Change (or with `None`, clear) a device's display name
    pub async fn rename_device(
        &self,
        user: UserId,
        agent_id: &AgentId,
        friendly_name: Option<String>,
    ) -> Result<(), RenameError> {
        let Some(record) = self.store.get_agent(agent_id.as_str()).await? else {
            return Err(RenameError::NotFound);
        };
        if record.owner() != user {
            return Err(RenameError::Forbidden);
        }

        let name = friendly_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        self.store.set_friendly_name(agent_id.as_str(), name).await?;
        tracing::info!("User {} renamed {}", user, agent_id);
        Ok(())
    }

    fn device_info(&self, record: &AgentRecord, selected: Option<&str>) -> DeviceInfo {
        let live = self.registry.get_agent(&record.id());
        DeviceInfo {
            agent_id: record.id(),
            machine_name: record.machine_name.clone(),
            friendly_name: record.friendly_name.clone(),
            is_online: live.as_ref().is_some_and(|a| a.is_online),
            last_seen: live.as_ref().map(|a| a.last_heartbeat),
            os_version: live.as_ref().and_then(|a| a.info.os_version.clone()),
            user_name: live.as_ref().and_then(|a| a.info.user_name.clone()),
            is_selected: selected == Some(record.agent_id.as_str()),
        }
    }
}

fn routing_failure(error: RoutingError) -> CommandResult {
    match error {
        RoutingError::NoDeviceSelected => {
            CommandResult::failed(DispatchFailure::NoDeviceSelected, "No device selected")
        }
        RoutingError::NotFound => {
            CommandResult::failed(DispatchFailure::DeviceNotFound, "Device not found")
        }
        RoutingError::Offline { name } => CommandResult::failed(
            DispatchFailure::DeviceOffline,
            format!("Device {} is offline", name),
        ),
        RoutingError::Store(e) => {
            tracing::error!("Routing lookup failed: {}", e);
            CommandResult::failed(DispatchFailure::TransportFailure, "Broker storage error")
        }
    }
}

fn correlation_failure(error: CorrelationError, machine_name: &str) -> CommandResult {
    match error {
        CorrelationError::Timeout(after) => CommandResult::failed(
            DispatchFailure::Timeout,
            format!("{} did not respond within {}s", machine_name, after.as_secs()),
        ),
        CorrelationError::TransportFailure(reason) => CommandResult::failed(
            DispatchFailure::TransportFailure,
            format!("Lost connection to {}: {}", machine_name, reason),
        ),
        CorrelationError::Cancelled => {
            CommandResult::failed(DispatchFailure::Cancelled, "Broker is shutting down")
        }
    }
}
