//! Row types for the broker database

use rr_core::{AgentId, UserId};

/// A durable agent identity
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AgentRecord {
    pub agent_id: String,
    pub token_hash: String,
    pub owner_user_id: i64,
    pub machine_name: String,
    pub friendly_name: Option<String>,
    pub registered_at: i64,
}

impl AgentRecord {
    /// Typed agent ID
    pub fn id(&self) -> AgentId {
        AgentId::new(self.agent_id.clone())
    }

    /// Typed owner ID
    pub fn owner(&self) -> UserId {
        UserId::new(self.owner_user_id)
    }

    /// Name to show the operator
    pub fn display_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.machine_name)
    }
}

/// Fields of an identity about to be minted from a pairing ticket
///
/// The owner comes from the ticket, not from the caller.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub agent_id: String,
    pub token_hash: String,
    pub machine_name: String,
    pub friendly_name: Option<String>,
}

/// A one-time pairing code
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PairingTicket {
    pub code: String,
    pub owner_user_id: i64,
    pub expires_at: i64,
}

/// A user's current device choice
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceSelection {
    pub user_id: i64,
    pub agent_id: String,
    pub updated_at: i64,
}

/// Result of presenting a pairing code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    /// The ticket was live; this identity now exists
    Redeemed(AgentRecord),
    /// The ticket existed but had expired; it has been deleted
    Expired,
    /// No ticket with that code
    Unknown,
}
