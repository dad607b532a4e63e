//! Envelope types for the Remote Relay protocol
//!
//! Every frame on the agent link carries exactly one [`Message`].
//!
//! # Message Flow
//!
//! 1. Agent connects and sends `Register` with either its durable token or a
//!    one-time pairing code. This must be the first frame.
//! 2. If the agent paired with a code, the broker answers with
//!    `PushCredential` carrying the newly minted token. A rejected agent
//!    receives nothing; the broker simply closes the connection.
//! 3. The agent sends `Heartbeat` periodically.
//! 4. The broker sends `Execute` with a fresh correlation ID; the agent
//!    eventually answers with `Respond` carrying the same ID. Requests are
//!    independent and may complete in any order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::{AgentCommand, AgentInfo, AgentResponse};

/// Current protocol version string.
///
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Agent introduces itself with a credential
    Register = 0x01,
    /// Broker hands a freshly minted credential to a paired agent
    PushCredential = 0x02,
    /// Agent liveness signal
    Heartbeat = 0x03,
    /// Broker asks the agent to run a command
    Execute = 0x04,
    /// Agent answers a previous `Execute`
    Respond = 0x05,
}

impl MessageType {
    /// Convert to raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse from raw byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::PushCredential),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Execute),
            0x05 => Some(Self::Respond),
            _ => None,
        }
    }
}

/// Protocol message
#[derive(Clone, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration (first frame on every connection)
    Register {
        /// Durable agent token or one-time pairing code
        credential: String,
        /// What the agent reports about itself
        info: AgentInfo,
    },

    /// Credential issued after a successful pairing
    PushCredential {
        /// Identity assigned to the agent
        agent_id: String,
        /// Token to present on every future connection
        token: String,
    },

    /// Periodic liveness signal with refreshed agent info
    Heartbeat { info: AgentInfo },

    /// Command for the agent
    Execute(AgentCommand),

    /// Result of a previously received command
    Respond(AgentResponse),
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::PushCredential { .. } => MessageType::PushCredential,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::Execute(_) => MessageType::Execute,
            Message::Respond(_) => MessageType::Respond,
        }
    }
}

// Credentials must never end up in logs.
impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Register { info, .. } => f
                .debug_struct("Register")
                .field("credential", &"<redacted>")
                .field("info", info)
                .finish(),
            Message::PushCredential { agent_id, .. } => f
                .debug_struct("PushCredential")
                .field("agent_id", agent_id)
                .field("token", &"<redacted>")
                .finish(),
            Message::Heartbeat { info } => f.debug_struct("Heartbeat").field("info", info).finish(),
            Message::Execute(command) => f.debug_tuple("Execute").field(command).finish(),
            Message::Respond(response) => f.debug_tuple("Respond").field(response).finish(),
        }
    }
}
