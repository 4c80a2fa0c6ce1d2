//! Inbound stream bridge
//!
//! The tunnel server opens streams addressed to `(id, type)`. The bridge
//! looks the pair up in the connection's registered targets, dials the
//! recorded local address and relays bytes both ways until either side
//! finishes.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use outpost_protocol::{DynStream, InboundHandler, ProtocolError, Target};

use super::registry::{ConnectionKey, ConnectionRegistry};

const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{key}: no matching target found for {target}")]
    NoMatchingTarget { key: ConnectionKey, target: Target },

    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("relay error: {0}")]
    Relay(#[source] io::Error),
}

impl From<BridgeError> for ProtocolError {
    fn from(e: BridgeError) -> Self {
        ProtocolError::Handler(e.to_string())
    }
}

/// Where a target is reached locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAddress<'a> {
    Tcp(&'a str),
    Unix(&'a str),
}

impl<'a> LocalAddress<'a> {
    pub fn parse(address: &'a str) -> Self {
        match address.strip_prefix(UNIX_SCHEME) {
            Some(path) => LocalAddress::Unix(path),
            None => LocalAddress::Tcp(address),
        }
    }

    /// Connect from the agent's own namespace
    pub async fn connect(self) -> io::Result<DynStream> {
        match self {
            LocalAddress::Tcp(address) => Ok(Box::new(TcpStream::connect(address).await?)),
            #[cfg(unix)]
            LocalAddress::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            LocalAddress::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets are not supported: {}", path),
            )),
        }
    }
}

/// Serves inbound streams of one (tunnel, destination) connection
pub struct Bridge {
    registry: Arc<ConnectionRegistry>,
    key: ConnectionKey,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(registry: Arc<ConnectionRegistry>, key: ConnectionKey, cancel: CancellationToken) -> Self {
        Self {
            registry,
            key,
            cancel,
        }
    }

    async fn relay(&self, target: Target, mut inbound: DynStream) -> Result<(), BridgeError> {
        let address = self
            .registry
            .dial_address(&self.key, &target)
            .await
            .ok_or_else(|| BridgeError::NoMatchingTarget {
                key: self.key.clone(),
                target: target.clone(),
            })?;

        tracing::info!("{}: dialing {} for target {}", self.key, address, target);
        let mut local = LocalAddress::parse(&address)
            .connect()
            .await
            .map_err(|source| BridgeError::Dial {
                address: address.clone(),
                source,
            })?;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!("{}: relay for {} cancelled", self.key, target);
                Ok(())
            }
            copied = tokio::io::copy_bidirectional(&mut inbound, &mut local) => {
                let (sent, received) = copied.map_err(BridgeError::Relay)?;
                tracing::debug!(
                    "{}: relay for {} done, {} bytes in, {} bytes out",
                    self.key, target, sent, received
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl InboundHandler for Bridge {
    async fn handle(&self, target: Target, stream: DynStream) -> Result<(), ProtocolError> {
        self.relay(target, stream).await.map_err(|e| {
            tracing::warn!("{}", e);
            e.into()
        })
    }
}
