//! Frame header encoding/decoding
//!
//! Every frame starts with a 9-byte header:
//! - version: 1 byte (`WIRE_VERSION`)
//! - message_type: 1 byte (u8)
//! - stream_id: 4 bytes (u32, big-endian, 0 = control)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Wire format version carried in the first header byte
pub const WIRE_VERSION: u8 = 1;

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(stream_id: StreamId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            stream_id,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(WIRE_VERSION);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32(self.stream_id.as_u32());
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer.
    ///
    /// Nothing is consumed unless a full, valid header is present.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[0] != WIRE_VERSION {
            return Err(ProtocolError::InvalidHeader);
        }
        let message_type =
            MessageType::from_u8(src[1]).ok_or(ProtocolError::UnknownMessageType(src[1]))?;

        src.advance(2);
        let stream_id = StreamId::new(src.get_u32());
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;

        Ok(Some(Self {
            message_type,
            stream_id,
            payload_length: (len_high << 16) | len_low,
        }))
    }
}
