//! outpost-protocol: Tunnel wire capability for the outpost agent
//!
//! This crate defines what the agent needs from a tunnel server connection:
//! registering the agent, announcing and withdrawing targets, and accepting
//! inbound streams addressed to a target. The [`TunnelClient`] trait is the
//! seam the agent programs against; [`FramedClient`] is the framed binary
//! implementation spoken over any byte stream.

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;
pub mod target;

pub use client::{
    ClientFactory, DynStream, FramedClient, FramedClientFactory, InboundHandler, TunnelClient,
    TunnelStream,
};
pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
pub use stream::StreamId;
pub use target::Target;
