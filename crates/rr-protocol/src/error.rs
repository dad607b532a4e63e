//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or decoding envelopes
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Header type byte disagrees with the decoded payload
    #[error("Frame type mismatch: header says {header:?}, payload is {payload:?}")]
    TypeMismatch {
        header: crate::message::MessageType,
        payload: crate::message::MessageType,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
