//! Connection manager
//!
//! Runs one lifecycle task per (tunnel, destination): resolve the namespace,
//! dial with retry, secure the transport, register with the tunnel server,
//! register the tunnel's targets, then serve until the connection ends.
//!
//! Methods taking `&mut DesiredState` expect the caller to hold the tree
//! lock. Lifecycle tasks take the tree lock before touching state and check
//! their cancellation token under it, so a stopped task never writes state.
//! Lock order is always tree, then registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use outpost_core::config::AgentConfig;
use outpost_core::error::ConnectionError;
use outpost_core::OperState;
use outpost_protocol::{ClientFactory, DynStream, ProtocolError, Target, TunnelClient};

use super::bridge::Bridge;
use super::dialer::{Dialer, Namespace};
use super::registry::{ConnectionKey, ConnectionRegistry};
use super::retry::{Attempt, RetryPolicy};
use super::security::TransportSecurity;
use crate::schema::{AssociationDocument, TargetStateDocument, TunnelDocument};
use crate::targets::TargetResolver;
use crate::telemetry::{publish_document, StatePath, StatePublisher};
use crate::tree::{DesiredState, Destination, DestinationAssoc, TargetConfig, TargetState, Tunnel};

/// Down reason when root or tunnel admin state is disabled
pub const ADMIN_DOWN: &str = "admin down";

/// Default down reason of a stopped connection
pub const TUNNEL_STOPPED: &str = "tunnel stopped";

/// Down reason when the tunnel server ends the serve loop cleanly
pub const CONNECTION_CLOSED: &str = "connection closed";

/// Down reason of an association naming an unknown destination
pub const DESTINATION_NOT_CONFIGURED: &str = "destination not configured";

/// The desired-state tree behind its lock
pub type SharedState = Arc<Mutex<DesiredState>>;

/// Starts, supervises and stops tunnel connections
#[derive(Clone)]
pub struct ConnectionManager {
    tree: SharedState,
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn StatePublisher>,
    dialer: Arc<dyn Dialer>,
    security: TransportSecurity,
    factory: Arc<dyn ClientFactory>,
    resolver: Arc<TargetResolver>,
    retry: RetryPolicy,
    default_network_instance: String,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: &AgentConfig,
        tree: SharedState,
        resolver: TargetResolver,
        publisher: Arc<dyn StatePublisher>,
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn ClientFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tree,
            registry: Arc::new(ConnectionRegistry::new()),
            publisher,
            dialer,
            security: TransportSecurity::new(),
            factory,
            resolver: Arc::new(resolver),
            retry: RetryPolicy::from_config(config),
            default_network_instance: config.default_network_instance.clone(),
            shutdown,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tree(&self) -> &SharedState {
        &self.tree
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Arc<dyn StatePublisher> {
        &self.publisher
    }

    /// Start every tunnel; one tunnel failing never blocks the others.
    pub async fn start_all(&self, state: &mut DesiredState) {
        let names: Vec<String> = state.tunnels.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.start_tunnel(state, &name).await {
                tracing::error!("Failed to start tunnel {}: {}", name, e);
            }
        }
    }

    /// Stop every tunnel, including connections whose tunnel config is gone.
    pub async fn stop_all(&self, state: &mut DesiredState, reason: &str) {
        let mut names: BTreeSet<String> = state.tunnels.keys().cloned().collect();
        names.extend(self.registry.keys().await.into_iter().map(|key| key.tunnel));
        for name in names {
            self.stop_tunnel(state, &name, reason).await;
        }
    }

    /// Start a connection for every association of `name` whose destination
    /// is configured.
    ///
    /// Fails with [`ConnectionError::NoDestinations`] when there is none.
    pub async fn start_tunnel(&self, state: &mut DesiredState, name: &str) -> Result<(), ConnectionError> {
        let may_run = state.may_run(name);
        let Some(tunnel) = state.tunnels.get_mut(name) else {
            return Ok(());
        };

        if !may_run {
            tunnel.set_state(OperState::Down, ADMIN_DOWN);
            self.publish_tunnel(name, tunnel);
            return Ok(());
        }

        let mut startable = Vec::new();
        for (destination, assoc) in tunnel.destinations.iter_mut() {
            if state.destinations.contains_key(destination) {
                startable.push(destination.clone());
            } else {
                assoc.set_state(OperState::Down, DESTINATION_NOT_CONFIGURED);
                self.publish_association(&ConnectionKey::new(name, destination), assoc);
            }
        }
        tracing::info!("tunnel={} destinations={:?}", name, startable);

        if startable.is_empty() {
            let err = ConnectionError::NoDestinations;
            tunnel.set_state(OperState::Down, err.to_string());
            self.publish_tunnel(name, tunnel);
            return Err(err);
        }

        for destination in startable {
            self.start_tunnel_destination(state, name, &destination).await;
        }
        Ok(())
    }

    /// Spawn the lifecycle task of `(tunnel, destination)` unless it is
    /// gated by admin state, already up, or already in progress.
    pub async fn start_tunnel_destination(&self, state: &mut DesiredState, tunnel_name: &str, destination_name: &str) {
        if !state.may_run(tunnel_name) {
            return;
        }

        let key = ConnectionKey::new(tunnel_name, destination_name);
        let Some(destination) = state.destinations.get(destination_name).cloned() else {
            if let Some(assoc) = state.association_mut(tunnel_name, destination_name) {
                assoc.set_state(OperState::Down, DESTINATION_NOT_CONFIGURED);
                self.publish_association(&key, assoc);
            }
            return;
        };

        let Some(tunnel) = state.tunnels.get_mut(tunnel_name) else {
            return;
        };
        let Some(assoc) = tunnel.destinations.get_mut(destination_name) else {
            return;
        };
        if assoc.oper_state == OperState::Up || self.registry.contains(&key).await {
            tracing::info!("{}: already running", key);
            return;
        }

        let cancel = self.shutdown.child_token();
        let Some(generation) = self.registry.insert_pending(key.clone(), cancel.clone()).await else {
            return;
        };

        assoc.set_state(OperState::Starting, "");
        self.publish_association(&key, assoc);
        if tunnel.oper_state != OperState::Up {
            tunnel.set_state(OperState::Starting, "");
            self.publish_tunnel(tunnel_name, tunnel);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_destination(key, generation, destination, cancel)
                .await
        });
    }

    /// Tear down every connection of `name` and mark the tunnel down.
    pub async fn stop_tunnel(&self, state: &mut DesiredState, name: &str, reason: &str) {
        let mut destinations: BTreeSet<String> = self
            .registry
            .keys_for_tunnel(name)
            .await
            .into_iter()
            .map(|key| key.destination)
            .collect();
        if let Some(tunnel) = state.tunnel(name) {
            destinations.extend(tunnel.destinations.keys().cloned());
        }

        for destination in destinations {
            self.stop_tunnel_destination(state, name, &destination, reason)
                .await;
        }

        if let Some(tunnel) = state.tunnel_mut(name) {
            tunnel.set_state(OperState::Down, reason);
            self.publish_tunnel(name, tunnel);
        }
    }

    /// Deregister every target (best effort), close the transport, and mark
    /// the association and its target states down with `reason`.
    pub async fn stop_tunnel_destination(&self, state: &mut DesiredState, tunnel: &str, destination: &str, reason: &str) {
        let key = ConnectionKey::new(tunnel, destination);
        if let Some(conn) = self.registry.remove(&key).await {
            if let Some(client) = conn.client() {
                for details in conn.targets().values() {
                    let target = details.target();
                    tracing::info!("{}: deleting target {}", key, target);
                    if let Err(e) = client.delete_target(&target).await {
                        tracing::warn!("{}: failed to delete target {}: {}", key, target, e);
                    }
                }
            }
            conn.shutdown();
            tracing::info!("{}: stopped ({})", key, reason);
        }

        if let Some(assoc) = state.association_mut(tunnel, destination) {
            assoc.set_state(OperState::Down, reason);
            for target_state in assoc.targets.values_mut() {
                target_state.oper_state = OperState::Down;
                target_state.down_reason = reason.to_string();
            }
            self.publish_association(&key, assoc);
            self.publish_target_states(&key, assoc);
        }
    }

    /// Process shutdown: stop everything, then cancel remaining work.
    pub async fn shutdown(&self) {
        {
            let mut state = self.tree.lock().await;
            self.stop_all(&mut state, TUNNEL_STOPPED).await;
        }
        self.shutdown.cancel();
    }

    /// Keys of the live (registered) connections of `tunnel`
    pub async fn live_connections(&self, tunnel: &str) -> Vec<ConnectionKey> {
        let mut live = Vec::new();
        for key in self.registry.keys_for_tunnel(tunnel).await {
            if self.registry.is_live(&key).await {
                live.push(key);
            }
        }
        live
    }

    /// Register target config `name` of `tunnel` on every live connection
    pub async fn register_tunnel_target(&self, state: &mut DesiredState, tunnel: &str, name: &str) {
        let Some(config) = state
            .tunnel(tunnel)
            .and_then(|t| t.targets.get(name))
            .cloned()
        else {
            return;
        };
        for key in self.live_connections(tunnel).await {
            self.register_target(state, &key, name, &config).await;
        }
    }

    /// Deregister target config `name` of `tunnel` from every live connection
    pub async fn deregister_tunnel_target(&self, state: &mut DesiredState, tunnel: &str, name: &str) {
        for key in self.live_connections(tunnel).await {
            self.deregister_target(state, &key, name).await;
        }
    }

    /// Resolve `config` and announce it on the connection `key`.
    ///
    /// Resolution errors and a missing connection skip the target.
    pub async fn register_target(&self, state: &mut DesiredState, key: &ConnectionKey, name: &str, config: &TargetConfig) {
        let details = match self.resolver.resolve(config) {
            Ok(details) => details,
            Err(e) => {
                tracing::error!("{}: failed to resolve target {}: {}", key, name, e);
                return;
            }
        };
        let target = details.target();

        let Some(client) = self.registry.record_target(key, name, details).await else {
            tracing::error!("{}: client not found, target {} not registered", key, name);
            return;
        };
        let Some(assoc) = state.association_mut(&key.tunnel, &key.destination) else {
            return;
        };

        let target_state = assoc.targets.entry(target.key()).or_default();
        target_state.oper_state = OperState::Starting;
        target_state.down_reason.clear();
        self.publish_target_state(key, &target, target_state);

        tracing::info!("{}: registering target {} from {}", key, target, name);
        match client.new_target(&target).await {
            Ok(()) => {
                target_state.oper_state = OperState::Up;
                tracing::info!("{}: registered target {}", key, target);
            }
            Err(e) => {
                tracing::error!("{}: failed to register target {}: {}", key, target, e);
                target_state.oper_state = OperState::Down;
                target_state.down_reason = e.to_string();
            }
        }
        self.publish_target_state(key, &target, target_state);
    }

    /// Withdraw target config `name` from `key`; absent targets are a no-op.
    pub async fn deregister_target(&self, state: &mut DesiredState, key: &ConnectionKey, name: &str) {
        let Some((details, client)) = self.registry.take_target(key, name).await else {
            return;
        };
        let target = details.target();

        tracing::info!("{}: deleting target {} from {}", key, target, name);
        if let Err(e) = client.delete_target(&target).await {
            tracing::warn!("{}: failed to delete target {}: {}", key, target, e);
        }
        self.publisher.delete(&StatePath::target_state(
            &key.tunnel,
            &key.destination,
            &target,
        ));
        if let Some(assoc) = state.association_mut(&key.tunnel, &key.destination) {
            assoc.targets.remove(&target.key());
        }
    }

    // --- lifecycle task ---

    async fn run_destination(self, key: ConnectionKey, generation: u64, destination: Destination, cancel: CancellationToken) {
        let network_instance = destination
            .network_instance
            .clone()
            .filter(|ni| !ni.is_empty())
            .unwrap_or_else(|| self.default_network_instance.clone());

        let namespace = match self.dialer.resolve(&network_instance) {
            Ok(namespace) => namespace,
            Err(e) => {
                tracing::error!("{}: {}", key, e);
                self.mark_down(&key, generation, &cancel, &e.to_string(), true)
                    .await;
                return;
            }
        };
        tracing::debug!("{}: dialing from namespace {}", key, namespace.name);

        let Some(transport) = self
            .dial_with_retry(&key, generation, &namespace, &destination, &cancel)
            .await
        else {
            return;
        };
        tracing::info!("{}: connected to {}", key, destination.server_address());

        let handler = Arc::new(Bridge::new(
            Arc::clone(&self.registry),
            key.clone(),
            cancel.clone(),
        ));
        let client = match self.factory.new_client(transport, handler) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("{}: failed to create tunnel client: {}", key, e);
                self.mark_down(&key, generation, &cancel, &e.to_string(), true)
                    .await;
                return;
            }
        };

        if let Err(e) = client.register(&cancel).await {
            client.close();
            if cancel.is_cancelled() || matches!(e, ProtocolError::Cancelled) {
                return;
            }
            tracing::error!("{}: failed to register: {}", key, e);
            self.mark_down(&key, generation, &cancel, &format!("register failed: {}", e), true)
                .await;
            return;
        }

        if !self.mark_up(&key, generation, &cancel, &client).await {
            client.close();
            return;
        }
        tracing::info!("{}: registered", key);

        let result = client.start(cancel.clone()).await;
        if cancel.is_cancelled() {
            tracing::debug!("{}: serve loop stopped", key);
            return;
        }
        let reason = match result {
            Ok(()) => {
                tracing::warn!("{}: connection closed by server", key);
                CONNECTION_CLOSED.to_string()
            }
            Err(e) => {
                tracing::warn!("{}: connection failed: {}", key, e);
                e.to_string()
            }
        };
        client.close();
        self.mark_failed(&key, generation, &cancel, &reason).await;
    }

    /// Dial until success; `None` once cancelled.
    async fn dial_with_retry(
        &self,
        key: &ConnectionKey,
        generation: u64,
        namespace: &Namespace,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> Option<DynStream> {
        let address = destination.server_address();
        loop {
            let reason = match self
                .retry
                .attempt(cancel, self.connect(namespace, &address, destination))
                .await?
            {
                Attempt::Done(transport) => return Some(transport),
                Attempt::Failed(e) => e.to_string(),
                Attempt::TimedOut => ConnectionError::DialTimeout(address.clone()).to_string(),
            };

            tracing::warn!("{}: {}, retrying in {:?}", key, reason, self.retry.interval);
            self.mark_down(key, generation, cancel, &reason, false).await;
            if !self.retry.wait(cancel).await {
                return None;
            }
        }
    }

    async fn connect(&self, namespace: &Namespace, address: &str, destination: &Destination) -> Result<DynStream, ConnectionError> {
        let transport = self.dialer.dial(namespace, address).await?;
        self.security.secure(transport, destination).await
    }

    /// Association down with `reason`; `release` also drops the registry entry.
    async fn mark_down(&self, key: &ConnectionKey, generation: u64, cancel: &CancellationToken, reason: &str, release: bool) {
        let mut state = self.tree.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if release {
            self.registry.remove_if_generation(key, generation).await;
        }
        if let Some(assoc) = state.association_mut(&key.tunnel, &key.destination) {
            assoc.set_state(OperState::Down, reason);
            self.publish_association(key, assoc);
        }
    }

    /// Install the registered client, bring the association and tunnel up,
    /// and register every configured target. False if the connection was
    /// stopped meanwhile.
    async fn mark_up(&self, key: &ConnectionKey, generation: u64, cancel: &CancellationToken, client: &Arc<dyn TunnelClient>) -> bool {
        let mut guard = self.tree.lock().await;
        let state = &mut *guard;
        if cancel.is_cancelled() {
            return false;
        }
        if !self
            .registry
            .attach_client(key, generation, Arc::clone(client))
            .await
        {
            return false;
        }

        let Some(tunnel) = state.tunnels.get_mut(&key.tunnel) else {
            return false;
        };
        let Some(assoc) = tunnel.destinations.get_mut(&key.destination) else {
            return false;
        };

        assoc.set_state(OperState::Up, "");
        self.publish_association(key, assoc);
        // states from before a restart are rebuilt from config below
        for stale in std::mem::take(&mut assoc.targets).into_keys() {
            if let Some(target) = Target::from_key(&stale) {
                self.publisher.delete(&StatePath::target_state(
                    &key.tunnel,
                    &key.destination,
                    &target,
                ));
            }
        }

        if tunnel.oper_state != OperState::Up {
            tunnel.set_state(OperState::Up, "");
            self.publish_tunnel(&key.tunnel, tunnel);
        }

        let targets: Vec<(String, TargetConfig)> = tunnel
            .targets
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        if !targets.is_empty() {
            tracing::info!("{}: registering {} target(s)", key, targets.len());
        }
        for (name, config) in targets {
            self.register_target(state, key, &name, &config).await;
        }
        true
    }

    /// The serve loop ended on its own: classify by live admin intent.
    async fn mark_failed(&self, key: &ConnectionKey, generation: u64, cancel: &CancellationToken, reason: &str) {
        let mut guard = self.tree.lock().await;
        let state = &mut *guard;
        if cancel.is_cancelled() {
            return;
        }
        self.registry.remove_if_generation(key, generation).await;

        let may_run = state.may_run(&key.tunnel);
        let Some(tunnel) = state.tunnels.get_mut(&key.tunnel) else {
            return;
        };
        if may_run {
            tunnel.set_state(OperState::Failed, reason);
        } else {
            tunnel.set_state(OperState::Down, ADMIN_DOWN);
        }
        self.publish_tunnel(&key.tunnel, tunnel);

        if let Some(assoc) = tunnel.destinations.get_mut(&key.destination) {
            assoc.set_state(OperState::Down, reason);
            for target_state in assoc.targets.values_mut() {
                target_state.oper_state = OperState::Down;
                target_state.down_reason = reason.to_string();
            }
            self.publish_association(key, assoc);
            self.publish_target_states(key, assoc);
        }
    }

    // --- state mirror ---

    fn publish_tunnel(&self, name: &str, tunnel: &Tunnel) {
        publish_document(
            self.publisher.as_ref(),
            &StatePath::tunnel(name),
            TunnelDocument::from(tunnel),
        );
    }

    fn publish_association(&self, key: &ConnectionKey, assoc: &DestinationAssoc) {
        publish_document(
            self.publisher.as_ref(),
            &StatePath::association(&key.tunnel, &key.destination),
            AssociationDocument::from(assoc),
        );
    }

    fn publish_target_state(&self, key: &ConnectionKey, target: &Target, state: &TargetState) {
        publish_document(
            self.publisher.as_ref(),
            &StatePath::target_state(&key.tunnel, &key.destination, target),
            TargetStateDocument::from(state),
        );
    }

    fn publish_target_states(&self, key: &ConnectionKey, assoc: &DestinationAssoc) {
        for (target_key, state) in &assoc.targets {
            if let Some(target) = Target::from_key(target_key) {
                self.publish_target_state(key, &target, state);
            }
        }
    }
}
