//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Invalid frame header
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tunnel server refused the agent registration
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// A message arrived that is not valid at this point of the exchange
    #[error("Unexpected message: {0:?}")]
    UnexpectedMessage(crate::message::MessageType),

    /// Operation attempted before `register` succeeded
    #[error("Client is not registered")]
    NotRegistered,

    /// `register` called twice on the same client
    #[error("Client is already registered")]
    AlreadyRegistered,

    /// The connection closed while an operation was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection failed while serving
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The inbound handler failed to serve a stream
    #[error("Handler error: {0}")]
    Handler(String),
}
