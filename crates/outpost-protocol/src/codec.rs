//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;
use crate::stream::StreamId;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self { stream_id, message }
    }

    /// A frame on the control stream
    pub fn control(message: Message) -> Self {
        Self::new(StreamId::CONTROL, message)
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header decoded while its payload is still incomplete
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
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

        let payload = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload)?;
        if message.message_type() != header.message_type {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Some(Frame {
            stream_id: header.stream_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(
            frame.stream_id,
            frame.message.message_type(),
            payload.len() as u32,
        )
        .encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use crate::target::Target;
    use bytes::Bytes;

    #[test]
    fn test_codec_stream_open() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(
            StreamId::new(3),
            Message::StreamOpen(Target::new("leaf1", "GNMI_GNOI")),
        );

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(StreamId::new(9), Message::Data(Bytes::from("Hello, tunnel!")));

        let mut full_buf = BytesMut::new();
        codec.encode(frame.clone(), &mut full_buf).unwrap();

        // header present, payload cut short
        let mut partial = full_buf.split_to(HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
    }

    #[test]
    fn test_codec_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::control(Message::Heartbeat { timestamp: 1 }), &mut buf)
            .unwrap();
        codec
            .encode(
                Frame::new(StreamId::new(2), Message::StreamClose { error: None }),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.stream_id.is_control());
        assert_eq!(second.stream_id, StreamId::new(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_mismatched_type() {
        let mut codec = FrameCodec::new();
        let payload = bincode::serialize(&Message::Heartbeat { timestamp: 5 }).unwrap();

        let mut buf = BytesMut::new();
        FrameHeader::new(
            StreamId::CONTROL,
            crate::message::MessageType::Data,
            payload.len() as u32,
        )
        .encode(&mut buf);
        buf.extend_from_slice(&payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidHeader)
        ));
    }
}
