//! Connection registry
//!
//! In-memory table of agents that have authenticated on this broker. Each
//! entry holds the transport handle of the agent's current connection, so
//! dispatch can reach it, plus liveness data for device listings.
//!
//! # Supersession
//!
//! There is at most one record per agent. A reconnect replaces the handle in
//! place and closes the previous connection; it never adds a second record.
//! The reverse index (connection -> agent) lets a closing connection mark its
//! agent offline without knowing who it was, and is checked against the
//! record's current handle so a late disconnect of a superseded connection
//! cannot flip a fresh connection offline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rr_core::time::current_time_millis;
use rr_core::{AgentId, UserId};
use rr_protocol::{AgentInfo, Message};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one agent connection (one TCP session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique connection ID
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The connection's outbound queue has been closed
#[derive(Debug, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct TransportClosed(pub ConnectionId);

/// Sending half of one agent connection
///
/// Messages are queued to the connection's writer task. Closing the handle
/// makes the connection tear itself down.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
    peer_addr: Option<SocketAddr>,
}

impl TransportHandle {
    /// Create a handle around a connection's outbound queue
    pub fn new(
        outbound: mpsc::Sender<Message>,
        closed: CancellationToken,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound,
            closed,
            peer_addr,
        }
    }

    /// Connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a message for the agent
    ///
    /// Fails immediately if the connection is already gone.
    pub async fn send(&self, message: Message) -> Result<(), TransportClosed> {
        if self.closed.is_cancelled() {
            return Err(TransportClosed(self.id));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportClosed(self.id))
    }

    /// Ask the connection to shut down
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has been asked to shut down
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }
}

/// Snapshot of a registered agent
#[derive(Debug, Clone)]
pub struct ConnectedAgent {
    /// Agent identity
    pub agent_id: AgentId,
    /// Owner recorded at authentication time
    pub owner_user_id: Option<UserId>,
    /// Current (or last) connection
    pub handle: TransportHandle,
    /// False once the connection has closed
    pub is_online: bool,
    /// Unix milliseconds when the current connection authenticated
    pub connected_at: u64,
    /// Unix milliseconds of the last heartbeat (or of authentication)
    pub last_heartbeat: u64,
    /// What the agent last reported about itself
    pub info: AgentInfo,
}

/// Registry of connected agents
pub struct ConnectionRegistry {
    /// Records indexed by agent ID
    agents: DashMap<AgentId, ConnectedAgent>,
    /// Reverse index from connection to agent
    by_connection: DashMap<ConnectionId, AgentId>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Record that `agent_id` is now reachable over `handle`
    ///
    /// Replaces any existing record for the agent and closes the connection
    /// it pointed at.
    pub fn set_connected(
        &self,
        agent_id: AgentId,
        handle: TransportHandle,
        info: AgentInfo,
        owner_user_id: Option<UserId>,
    ) {
        let now = current_time_millis();
        let connection_id = handle.id();

        // Index first so a disconnect racing this call can always find us
        self.by_connection.insert(connection_id, agent_id.clone());

        let record = ConnectedAgent {
            agent_id: agent_id.clone(),
            owner_user_id,
            handle,
            is_online: true,
            connected_at: now,
            last_heartbeat: now,
            info,
        };

        let previous = self.agents.insert(agent_id.clone(), record);

        if let Some(previous) = previous {
            let old_id = previous.handle.id();
            if old_id != connection_id {
                self.by_connection.remove_if(&old_id, |_, owner| *owner == agent_id);
                previous.handle.close();
                tracing::info!(
                    "Agent {} reconnected on {}, superseding {}",
                    agent_id,
                    connection_id,
                    old_id
                );
            }
        } else {
            tracing::info!("Agent {} connected on {}", agent_id, connection_id);
        }
    }

    /// Mark the agent behind `connection_id` offline
    ///
    /// Unknown or superseded connections are ignored. Returns the agent that
    /// went offline, if any.
    pub fn set_disconnected(&self, connection_id: ConnectionId) -> Option<AgentId> {
        let (_, agent_id) = self.by_connection.remove(&connection_id)?;

        let mut record = self.agents.get_mut(&agent_id)?;
        if record.handle.id() != connection_id {
            return None;
        }
        record.is_online = false;
        drop(record);

        tracing::info!("Agent {} disconnected ({})", agent_id, connection_id);
        Some(agent_id)
    }

    /// Refresh liveness and reported info for a registered agent
    ///
    /// Returns false if the agent has no record.
    pub fn update_heartbeat(&self, agent_id: &AgentId, info: AgentInfo) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(mut record) => {
                record.last_heartbeat = current_time_millis();
                record.info = info;
                true
            }
            None => false,
        }
    }

    /// Get a snapshot of an agent's record
    pub fn get_agent(&self, agent_id: &AgentId) -> Option<ConnectedAgent> {
        self.agents.get(agent_id).map(|r| r.clone())
    }

    /// Which agent a connection belongs to
    pub fn agent_for_connection(&self, connection_id: ConnectionId) -> Option<AgentId> {
        self.by_connection.get(&connection_id).map(|r| r.clone())
    }

    /// Snapshots of every record
    pub fn list(&self) -> Vec<ConnectedAgent> {
        self.agents.iter().map(|r| r.clone()).collect()
    }

    /// Snapshots of the records owned by `owner`
    pub fn list_for_owner(&self, owner: UserId) -> Vec<ConnectedAgent> {
        self.agents
            .iter()
            .filter(|r| r.owner_user_id == Some(owner))
            .map(|r| r.clone())
            .collect()
    }

    /// Close an agent's current connection
    ///
    /// The record goes offline through the normal disconnect path once the
    /// connection task notices. Returns false if the agent is unknown.
    pub fn close_agent(&self, agent_id: &AgentId) -> bool {
        match self.agents.get(agent_id) {
            Some(record) => {
                record.handle.close();
                true
            }
            None => false,
        }
    }

    /// Online agents whose last heartbeat is older than `max_age`
    pub fn stale_agents(&self, max_age: Duration) -> Vec<ConnectedAgent> {
        let cutoff = current_time_millis().saturating_sub(max_age.as_millis() as u64);
        self.agents
            .iter()
            .filter(|r| r.is_online && r.last_heartbeat < cutoff)
            .map(|r| r.clone())
            .collect()
    }

    /// Number of agents currently online
    pub fn online_count(&self) -> usize {
        self.agents.iter().filter(|r| r.is_online).count()
    }

    /// Number of records, online or not
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Close every live connection (shutdown)
    pub fn close_all(&self) {
        for record in self.agents.iter() {
            record.handle.close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
