//! Runtime connection registry
//!
//! One entry per (tunnel, destination) whose lifecycle task has been
//! started. The lock is held for map access only, never across network I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use outpost_protocol::{Target, TunnelClient};

use crate::targets::TargetDetails;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub tunnel: String,
    pub destination: String,
}

impl ConnectionKey {
    pub fn new(tunnel: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            tunnel: tunnel.into(),
            destination: destination.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel={}, destination={}", self.tunnel, self.destination)
    }
}

/// A started connection: dialing, or registered with a live client
pub struct RuntimeConnection {
    cancel: CancellationToken,
    client: Option<Arc<dyn TunnelClient>>,
    /// Registered targets by target-config name
    targets: BTreeMap<String, TargetDetails>,
    generation: u64,
}

impl RuntimeConnection {
    pub fn client(&self) -> Option<Arc<dyn TunnelClient>> {
        self.client.clone()
    }

    pub fn targets(&self) -> &BTreeMap<String, TargetDetails> {
        &self.targets
    }

    /// Stop the lifecycle task and close the transport
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(client) = &self.client {
            client.close();
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionKey, RuntimeConnection>,
    next_generation: u64,
}

/// Live connections keyed by (tunnel, destination)
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a started connection with no client yet.
    ///
    /// Returns the generation identifying this entry, or `None` when one
    /// already exists for `key`.
    pub async fn insert_pending(&self, key: ConnectionKey, cancel: CancellationToken) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.connections.contains_key(&key) {
            return None;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.connections.insert(
            key,
            RuntimeConnection {
                cancel,
                client: None,
                targets: BTreeMap::new(),
                generation,
            },
        );
        Some(generation)
    }

    /// Install the registered client. False if the entry was replaced or removed.
    pub async fn attach_client(&self, key: &ConnectionKey, generation: u64, client: Arc<dyn TunnelClient>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.connections.get_mut(key) {
            Some(conn) if conn.generation == generation => {
                conn.client = Some(client);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, key: &ConnectionKey) -> bool {
        self.inner.lock().await.connections.contains_key(key)
    }

    /// Whether `key` has a registered client
    pub async fn is_live(&self, key: &ConnectionKey) -> bool {
        self.inner
            .lock()
            .await
            .connections
            .get(key)
            .map(|conn| conn.client.is_some())
            .unwrap_or(false)
    }

    /// Record `details` under `name` and return the client to register it on.
    ///
    /// `None` when there is no live connection for `key`.
    pub async fn record_target(&self, key: &ConnectionKey, name: &str, details: TargetDetails) -> Option<Arc<dyn TunnelClient>> {
        let mut inner = self.inner.lock().await;
        let conn = inner.connections.get_mut(key)?;
        let client = conn.client.clone()?;
        conn.targets.insert(name.to_string(), details);
        Some(client)
    }

    /// Remove the target recorded under `name`, with the client it was registered on
    pub async fn take_target(&self, key: &ConnectionKey, name: &str) -> Option<(TargetDetails, Arc<dyn TunnelClient>)> {
        let mut inner = self.inner.lock().await;
        let conn = inner.connections.get_mut(key)?;
        let client = conn.client.clone()?;
        let details = conn.targets.remove(name)?;
        Some((details, client))
    }

    /// Local dial address of the registered target matching `target`
    pub async fn dial_address(&self, key: &ConnectionKey, target: &Target) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .connections
            .get(key)?
            .targets
            .values()
            .find(|details| details.matches(target))
            .map(|details| details.dial_address.clone())
    }

    pub async fn remove(&self, key: &ConnectionKey) -> Option<RuntimeConnection> {
        self.inner.lock().await.connections.remove(key)
    }

    /// Remove the entry only if it is still the one created as `generation`
    pub async fn remove_if_generation(&self, key: &ConnectionKey, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.connections.get(key) {
            Some(conn) if conn.generation == generation => {
                inner.connections.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Keys of every started connection of `tunnel`
    pub async fn keys_for_tunnel(&self, tunnel: &str) -> Vec<ConnectionKey> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<ConnectionKey> = inner
            .connections
            .keys()
            .filter(|key| key.tunnel == tunnel)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub async fn keys(&self) -> Vec<ConnectionKey> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<ConnectionKey> = inner.connections.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn drain(&self) -> Vec<(ConnectionKey, RuntimeConnection)> {
        self.inner.lock().await.connections.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outpost_protocol::ProtocolError;

    struct IdleClient;

    #[async_trait]
    impl TunnelClient for IdleClient {
        async fn register(&self, _cancel: &CancellationToken) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn new_target(&self, _target: &Target) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn delete_target(&self, _target: &Target) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn start(&self, cancel: CancellationToken) -> Result<(), ProtocolError> {
            cancel.cancelled().await;
            Ok(())
        }
        fn close(&self) {}
    }

    fn details(id: &str, kind: &str, address: &str) -> TargetDetails {
        TargetDetails {
            id: id.to_string(),
            kind: kind.to_string(),
            dial_address: address.to_string(),
        }
    }

    #[tokio::test]
    async fn test_targets_need_a_live_client() {
        let registry = ConnectionRegistry::new();
        let key = ConnectionKey::new("t1", "d1");
        let generation = registry
            .insert_pending(key.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(registry
            .record_target(&key, "h1", details("leaf1", "SSH", "localhost:22"))
            .await
            .is_none());

        assert!(registry.attach_client(&key, generation, Arc::new(IdleClient)).await);
        assert!(registry.is_live(&key).await);
        assert!(registry
            .record_target(&key, "h1", details("leaf1", "SSH", "localhost:22"))
            .await
            .is_some());

        let address = registry
            .dial_address(&key, &Target::new("leaf1", "SSH"))
            .await;
        assert_eq!(address.as_deref(), Some("localhost:22"));
        assert!(registry
            .dial_address(&key, &Target::new("leaf1", "GNMI_GNOI"))
            .await
            .is_none());

        let (taken, _) = registry.take_target(&key, "h1").await.unwrap();
        assert_eq!(taken.id, "leaf1");
        assert!(registry.take_target(&key, "h1").await.is_none());
    }

    #[tokio::test]
    async fn test_generation_guards_stale_tasks() {
        let registry = ConnectionRegistry::new();
        let key = ConnectionKey::new("t1", "d1");

        let first = registry
            .insert_pending(key.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert!(registry
            .insert_pending(key.clone(), CancellationToken::new())
            .await
            .is_none());

        registry.remove(&key).await;
        let second = registry
            .insert_pending(key.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!registry.attach_client(&key, first, Arc::new(IdleClient)).await);
        assert!(!registry.remove_if_generation(&key, first).await);
        assert!(registry.contains(&key).await);
        assert!(registry.remove_if_generation(&key, second).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_for_tunnel() {
        let registry = ConnectionRegistry::new();
        for (tunnel, destination) in [("t1", "d2"), ("t2", "d1"), ("t1", "d1")] {
            registry
                .insert_pending(ConnectionKey::new(tunnel, destination), CancellationToken::new())
                .await;
        }

        assert_eq!(
            registry.keys_for_tunnel("t1").await,
            vec![ConnectionKey::new("t1", "d1"), ConnectionKey::new("t1", "d2")]
        );
        assert_eq!(registry.drain().await.len(), 3);
        assert!(registry.keys().await.is_empty());
    }
}
