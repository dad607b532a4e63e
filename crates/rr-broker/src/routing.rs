//! Routing and ownership checks
//!
//! Decides which connection a user's command goes to. Ownership is checked
//! against the store on every call; nothing here caches across dispatches.

use std::sync::Arc;

use rr_core::{AgentId, UserId};

use crate::registry::{ConnectionRegistry, TransportHandle};
use crate::store::{BrokerStore, StoreError};

/// A dispatchable agent
#[derive(Debug, Clone)]
pub struct AgentRef {
    pub agent_id: AgentId,
    pub machine_name: String,
    pub handle: TransportHandle,
}

/// Why a user's command cannot be routed
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no device selected")]
    NoDeviceSelected,

    #[error("device not found")]
    NotFound,

    #[error("device {name} is offline")]
    Offline { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves a user's selected device to a live connection
pub struct RoutingGate {
    store: BrokerStore,
    registry: Arc<ConnectionRegistry>,
}

impl RoutingGate {
    pub fn new(store: BrokerStore, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Find the connection for the device `user` has selected
    pub async fn resolve_target(&self, user: UserId) -> Result<AgentRef, RoutingError> {
        let selection = self
            .store
            .get_selection(user)
            .await?
            .ok_or(RoutingError::NoDeviceSelected)?;

        // A selection pointing at someone else's device is treated as missing
        let identity = match self.store.get_agent(&selection.agent_id).await? {
            Some(record) if record.owner() == user => record,
            Some(_) => {
                tracing::warn!(
                    "User {} selected agent {} owned by another user",
                    user,
                    selection.agent_id
                );
                return Err(RoutingError::NotFound);
            }
            None => return Err(RoutingError::NotFound),
        };

        match self.registry.get_agent(&identity.id()) {
            Some(agent) if agent.is_online => Ok(AgentRef {
                agent_id: agent.agent_id,
                machine_name: identity.display_name().to_string(),
                handle: agent.handle,
            }),
            _ => Err(RoutingError::Offline {
                name: identity.display_name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_token;
    use crate::registry::tests::test_handle;
    use crate::store::NewAgent;
    use rr_protocol::AgentInfo;

    async fn setup() -> (RoutingGate, BrokerStore, Arc<ConnectionRegistry>) {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        (RoutingGate::new(store.clone(), registry.clone()), store, registry)
    }

    async fn add_agent(store: &BrokerStore, id: &str, owner: i64) {
        store
            .insert_agent(
                &NewAgent {
                    agent_id: id.to_string(),
                    token_hash: hash_token(id),
                    machine_name: format!("{}-pc", id),
                    friendly_name: None,
                },
                UserId::new(owner),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_selection() {
        let (gate, _, _) = setup().await;
        assert!(matches!(
            gate.resolve_target(UserId::new(1)).await,
            Err(RoutingError::NoDeviceSelected)
        ));
    }

    #[tokio::test]
    async fn test_forged_selection_never_routes() {
        let (gate, store, registry) = setup().await;
        add_agent(&store, "agent-1", 2).await;
        let (handle, _rx) = test_handle();
        registry.set_connected(
            AgentId::new("agent-1"),
            handle,
            AgentInfo::new("pc"),
            Some(UserId::new(2)),
        );

        // User 1 has a selection row for user 2's device
        store.upsert_selection(UserId::new(1), "agent-1").await.unwrap();
        assert!(matches!(
            gate.resolve_target(UserId::new(1)).await,
            Err(RoutingError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_offline_differs_from_missing() {
        let (gate, store, registry) = setup().await;
        let user = UserId::new(1);
        add_agent(&store, "agent-1", 1).await;
        store.upsert_selection(user, "agent-1").await.unwrap();

        // Known identity, never connected
        match gate.resolve_target(user).await {
            Err(RoutingError::Offline { name }) => assert_eq!(name, "agent-1-pc"),
            other => panic!("expected offline, got {:?}", other),
        }

        let (handle, _rx) = test_handle();
        let conn = handle.id();
        registry.set_connected(AgentId::new("agent-1"), handle, AgentInfo::new("pc"), Some(user));
        let target = gate.resolve_target(user).await.unwrap();
        assert_eq!(target.handle.id(), conn);

        registry.set_disconnected(conn);
        assert!(matches!(
            gate.resolve_target(user).await,
            Err(RoutingError::Offline { .. })
        ));

        store.upsert_selection(user, "ghost").await.unwrap();
        assert!(matches!(
            gate.resolve_target(user).await,
            Err(RoutingError::NotFound)
        ));
    }
}
