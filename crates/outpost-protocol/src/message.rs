//! Message types for the tunnel protocol
//!
//! Messages are serialized into frames using the codec defined in
//! `codec.rs`. Control messages travel on [`StreamId::CONTROL`]; stream
//! messages carry the stream id allocated by the server.
//!
//! # Message Flow
//!
//! 1. Agent connects and sends `Register`, server answers `RegisterAck`
//! 2. Agent announces targets with `NewTarget` / withdraws them with
//!    `DeleteTarget`; the server may answer with `TargetAck`
//! 3. To reach a target the server sends `StreamOpen` on a fresh stream id
//! 4. Bytes flow as `Data` in both directions on that stream id
//! 5. Either side ends the stream with `StreamClose`
//! 6. The server sends `Heartbeat` periodically, the agent answers
//!    `HeartbeatAck`
//!
//! [`StreamId::CONTROL`]: crate::stream::StreamId::CONTROL

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Current protocol version string, sent in `Register`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Agent registration (agent -> server)
    Register = 0x01,
    /// Registration acknowledgment
    RegisterAck = 0x02,
    /// Announce a target
    NewTarget = 0x03,
    /// Withdraw a target
    DeleteTarget = 0x04,
    /// Server verdict on a target announcement
    TargetAck = 0x05,
    /// Server opens a stream towards a target
    StreamOpen = 0x06,
    /// Stream payload
    Data = 0x07,
    /// Stream termination
    StreamClose = 0x08,
    /// Heartbeat ping
    Heartbeat = 0x09,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x0A,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::NewTarget),
            0x04 => Some(Self::DeleteTarget),
            0x05 => Some(Self::TargetAck),
            0x06 => Some(Self::StreamOpen),
            0x07 => Some(Self::Data),
            0x08 => Some(Self::StreamClose),
            0x09 => Some(Self::Heartbeat),
            0x0A => Some(Self::HeartbeatAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Stream not found
    StreamNotFound = 1,
    /// Target not registered
    TargetNotFound = 2,
    /// Authentication failed
    AuthenticationFailed = 3,
    /// Invalid message
    InvalidMessage = 4,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration, sent once right after connecting.
    Register {
        /// Agent name
        agent: String,
        /// Protocol version; absent means 1.0
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Registration acknowledgment
    RegisterAck {
        accepted: bool,
        reason: Option<String>,
    },

    /// Announce a target to the server
    NewTarget(Target),

    /// Withdraw a previously announced target
    DeleteTarget(Target),

    /// Server verdict on a `NewTarget`
    TargetAck {
        target: Target,
        accepted: bool,
        reason: Option<String>,
    },

    /// Server opens the frame's stream towards `target`
    StreamOpen(Target),

    /// Stream payload
    Data(Bytes),

    /// Stream termination, with the error that ended it if any
    StreamClose { error: Option<String> },

    /// Heartbeat ping
    Heartbeat { timestamp: u64 },

    /// Heartbeat acknowledgment
    HeartbeatAck { timestamp: u64 },

    /// Error response
    Error { code: ErrorCode, message: String },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::NewTarget(_) => MessageType::NewTarget,
            Message::DeleteTarget(_) => MessageType::DeleteTarget,
            Message::TargetAck { .. } => MessageType::TargetAck,
            Message::StreamOpen(_) => MessageType::StreamOpen,
            Message::Data(_) => MessageType::Data,
            Message::StreamClose { .. } => MessageType::StreamClose,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Register,
            MessageType::RegisterAck,
            MessageType::NewTarget,
            MessageType::DeleteTarget,
            MessageType::TargetAck,
            MessageType::StreamOpen,
            MessageType::Data,
            MessageType::StreamClose,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            assert_eq!(MessageType::from_u8(byte), Some(msg_type));
        }
    }

    #[test]
    fn test_message_type_of_target_messages() {
        let target = Target::new("leaf1", "SSH");
        assert_eq!(
            Message::NewTarget(target.clone()).message_type(),
            MessageType::NewTarget
        );
        assert_eq!(
            Message::StreamOpen(target).message_type(),
            MessageType::StreamOpen
        );
    }
}
