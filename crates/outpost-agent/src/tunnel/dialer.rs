//! Namespace-scoped dialing
//!
//! A destination is dialed from the network namespace backing its network
//! instance. Entering a namespace is per OS thread, so [`NetnsDialer`] does
//! the blocking connect on a dedicated thread and hands the socket to tokio.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use outpost_core::config::AgentConfig;
use outpost_core::error::ConnectionError;
use outpost_protocol::DynStream;

/// A resolved network namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    /// Namespace handle; `None` dials from the agent's own namespace
    pub path: Option<PathBuf>,
}

impl Namespace {
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            path: None,
        }
    }
}

/// Opens transports towards tunnel servers
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Map a network instance to the namespace to dial from
    fn resolve(&self, network_instance: &str) -> Result<Namespace, ConnectionError>;

    /// Open a TCP connection to `address` from inside `namespace`
    async fn dial(&self, namespace: &Namespace, address: &str) -> Result<DynStream, ConnectionError>;
}

/// Dials from the agent's own namespace
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDialer;

#[async_trait]
impl Dialer for HostDialer {
    fn resolve(&self, _network_instance: &str) -> Result<Namespace, ConnectionError> {
        Ok(Namespace::host())
    }

    async fn dial(&self, _namespace: &Namespace, address: &str) -> Result<DynStream, ConnectionError> {
        dial_host(address).await
    }
}

async fn dial_host(address: &str) -> Result<DynStream, ConnectionError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|source| ConnectionError::DialFailed {
            address: address.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(Box::new(stream))
}

/// Dials from `<netns_dir>/<prefix><network instance>`
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct NetnsDialer {
    netns_dir: PathBuf,
    prefix: String,
    connect_timeout: Duration,
}

#[cfg(target_os = "linux")]
impl NetnsDialer {
    pub fn new(netns_dir: impl Into<PathBuf>, prefix: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            netns_dir: netns_dir.into(),
            prefix: prefix.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.netns_dir, &config.namespace_prefix, config.dial_timeout)
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl Dialer for NetnsDialer {
    fn resolve(&self, network_instance: &str) -> Result<Namespace, ConnectionError> {
        let name = format!("{}{}", self.prefix, network_instance);
        let path = self.netns_dir.join(&name);
        std::fs::metadata(&path).map_err(|source| ConnectionError::NamespaceNotFound {
            name: name.clone(),
            source,
        })?;
        Ok(Namespace {
            name,
            path: Some(path),
        })
    }

    async fn dial(&self, namespace: &Namespace, address: &str) -> Result<DynStream, ConnectionError> {
        let Some(path) = namespace.path.clone() else {
            return dial_host(address).await;
        };

        let failed = |source| ConnectionError::DialFailed {
            address: address.to_string(),
            source,
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        let target = address.to_string();
        let timeout = self.connect_timeout;
        std::thread::Builder::new()
            .name(format!("dial-{}", namespace.name))
            .spawn(move || {
                let _ = tx.send(netns::connect(&path, &target, timeout));
            })
            .map_err(failed)?;

        let stream = rx
            .await
            .map_err(|_| failed(std::io::Error::other("dial thread exited")))?
            .map_err(failed)?;
        stream.set_nonblocking(true).map_err(failed)?;
        let stream = TcpStream::from_std(stream).map_err(failed)?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

#[cfg(target_os = "linux")]
mod netns {
    use std::fs::File;
    use std::io;
    use std::net::{TcpStream, ToSocketAddrs};
    use std::path::Path;
    use std::time::Duration;

    use nix::sched::{setns, CloneFlags};

    /// Must run on a thread that is discarded afterwards: the namespace
    /// switch is never undone.
    pub(super) fn connect(namespace: &Path, address: &str, timeout: Duration) -> io::Result<TcpStream> {
        let handle = File::open(namespace)?;
        setns(&handle, CloneFlags::CLONE_NEWNET)?;

        let mut last_error = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        }))
    }
}

/// Dialer for this platform and configuration
pub fn dialer_for(config: &AgentConfig) -> Arc<dyn Dialer> {
    #[cfg(target_os = "linux")]
    {
        if config.use_namespaces {
            return Arc::new(NetnsDialer::from_config(config));
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        if config.use_namespaces {
            tracing::warn!("Network namespaces are not supported on this platform, dialing from the host");
        }
    }
    Arc::new(HostDialer)
}
