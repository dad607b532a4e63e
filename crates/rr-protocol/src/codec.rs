//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload_bytes)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload_len);
        FrameHeader::new(message.message_type(), payload_len as u32).encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AgentCommand, AgentInfo, AgentResponse, CommandType};
    use crate::correlation::CorrelationId;
    use crate::message::MessageType;

    #[test]
    fn test_codec_execute_message() {
        let mut codec = FrameCodec::new();
        let command = AgentCommand::new(CorrelationId::new("req-1"), CommandType::Cmd)
            .with_arguments("dir C:\\")
            .with_parameter("shell", "cmd");

        let mut buf = BytesMut::new();
        codec.encode(Message::Execute(command.clone()), &mut buf).unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Execute(decoded) => assert_eq!(decoded, command),
            other => panic!("Expected Execute message, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();
        let response = AgentResponse::photo(
            CorrelationId::new("req-2"),
            vec![0xAB; 4096],
            "screenshot.png",
        );

        let mut full_buf = BytesMut::new();
        codec
            .encode(Message::Respond(response.clone()), &mut full_buf)
            .unwrap();

        // Header plus part of the payload
        let mut partial = full_buf.split_to(HEADER_SIZE + 10);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        match codec.decode(&mut partial).unwrap().unwrap() {
            Message::Respond(decoded) => assert_eq!(decoded, response),
            other => panic!("Expected Respond message, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_multiple_frames_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                Message::Register {
                    credential: "ABC234".to_string(),
                    info: AgentInfo::new("desk-01"),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Message::Heartbeat {
                    info: AgentInfo::new("desk-01"),
                },
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message_type(), MessageType::Register);
        assert_eq!(second.message_type(), MessageType::Heartbeat);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::Respond, (MAX_PAYLOAD_SIZE + 1) as u32).encode(&mut buf);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_codec_rejects_type_mismatch() {
        let mut codec = FrameCodec::new();
        let payload = bincode::serialize(&Message::Heartbeat {
            info: AgentInfo::new("desk-01"),
        })
        .unwrap();

        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::Execute, payload.len() as u32).encode(&mut buf);
        buf.extend_from_slice(&payload);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::TypeMismatch { .. })));
    }
}
