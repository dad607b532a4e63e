//! rr-protocol: Wire protocol for Remote Relay
//!
//! This crate defines the framed binary envelope exchanged between remote
//! agents and the broker, along with the command and response payloads
//! that travel inside it.

pub mod codec;
pub mod command;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::FrameCodec;
pub use command::{AgentCommand, AgentInfo, AgentResponse, CommandType, ResponseKind};
pub use correlation::CorrelationId;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType, PROTOCOL_VERSION};
