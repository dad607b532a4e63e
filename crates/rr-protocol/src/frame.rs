//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - message_type: 1 byte (u8)
//! - payload_length: 4 bytes (u32, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (50 MiB)
///
/// Large enough for screenshots and file downloads, which the agent caps
/// below this limit before building a response.
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;

/// Frame header containing type and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown message type).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming anything
        let message_type =
            MessageType::from_u8(src[0]).ok_or(ProtocolError::UnknownMessageType(src[0]))?;

        src.advance(1);
        let payload_length = src.get_u32();

        Ok(Some(Self {
            message_type,
            payload_length,
        }))
    }
}
