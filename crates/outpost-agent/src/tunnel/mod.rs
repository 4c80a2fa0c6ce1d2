//! Tunnel server connections
//!
//! The [`ConnectionManager`] owns one lifecycle task per (tunnel,
//! destination) and the [`ConnectionRegistry`] of live connections; the
//! [`Bridge`] serves inbound streams from the targets recorded there.

mod bridge;
mod dialer;
mod manager;
mod registry;
mod retry;
mod security;

pub use bridge::{Bridge, BridgeError, LocalAddress};
#[cfg(target_os = "linux")]
pub use dialer::NetnsDialer;
pub use dialer::{dialer_for, Dialer, HostDialer, Namespace};
pub use manager::{
    ConnectionManager, SharedState, ADMIN_DOWN, CONNECTION_CLOSED, DESTINATION_NOT_CONFIGURED,
    TUNNEL_STOPPED,
};
pub use registry::{ConnectionKey, ConnectionRegistry, RuntimeConnection};
pub use retry::{Attempt, RetryPolicy};
pub use security::TransportSecurity;
