//! Configuration reconciler
//!
//! Notifications are buffered in arrival order until the commit marker, then
//! decoded and applied one by one under the tree lock. Applying a change
//! updates the tree, mirrors it to the state publisher and drives the
//! [`ConnectionManager`]. The reconciler never dials; connection work runs
//! in the manager's lifecycle tasks.

mod change;
mod notification;
pub mod paths;

pub use change::{Change, ConfigChange, DecodeError, TunnelSpec};
pub use notification::{ChangeNotification, Operation};

use std::sync::Arc;

use outpost_core::{AdminState, OperState};

use crate::schema::{
    AssociationDocument, DestinationDocument, RootDocument, TargetDocument, TunnelDocument,
};
use crate::telemetry::{publish_document, StatePath};
use crate::tree::{DesiredState, Destination, RootConfig, TargetConfig};
use crate::tunnel::{ConnectionManager, ADMIN_DOWN, DESTINATION_NOT_CONFIGURED, TUNNEL_STOPPED};

pub struct Reconciler {
    manager: ConnectionManager,
    pending: Vec<ChangeNotification>,
}

impl Reconciler {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            pending: Vec::new(),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Number of notifications waiting for the commit marker
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer `notification`; the commit marker applies the buffer.
    pub async fn handle(&mut self, notification: ChangeNotification) {
        if notification.is_commit() {
            self.commit().await;
        } else {
            tracing::debug!(
                "Buffered {:?} on {} {:?}",
                notification.op,
                notification.path,
                notification.keys
            );
            self.pending.push(notification);
        }
    }

    /// Apply every buffered notification in order, then clear the buffer.
    pub async fn commit(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Applying {} notification(s)", pending.len());

        let tree = Arc::clone(self.manager.tree());
        let mut state = tree.lock().await;
        for notification in pending {
            match ConfigChange::decode(&notification) {
                Ok(change) => self.apply(&mut state, change).await,
                Err(DecodeError::UnknownPath(path)) => {
                    tracing::warn!("Dropping notification for unknown path {}", path);
                }
                Err(DecodeError::UnknownOperation(path)) => {
                    tracing::warn!("Ignoring unsupported operation on {}", path);
                }
                Err(e) => tracing::error!("Skipping notification: {}", e),
            }
        }
    }

    /// Apply one decoded change. The caller holds the tree lock.
    pub async fn apply(&self, state: &mut DesiredState, change: ConfigChange) {
        match change {
            ConfigChange::Root(change) => self.apply_root(state, change).await,
            ConfigChange::Destination { name, change } => {
                self.apply_destination(state, &name, change).await
            }
            ConfigChange::Tunnel { name, change } => self.apply_tunnel(state, &name, change).await,
            ConfigChange::TunnelDestination {
                tunnel,
                destination,
                change,
            } => {
                self.apply_tunnel_destination(state, &tunnel, &destination, change)
                    .await
            }
            ConfigChange::TunnelTarget {
                tunnel,
                target,
                change,
            } => self.apply_tunnel_target(state, &tunnel, &target, change).await,
        }
    }

    async fn apply_root(&self, state: &mut DesiredState, change: Change<AdminState>) {
        match change {
            Change::Create(admin_state) => {
                state.root = RootConfig::default();
                self.set_root_admin(state, admin_state).await;
            }
            Change::Update(admin_state) => self.set_root_admin(state, admin_state).await,
            Change::Delete => {
                tracing::info!("Subsystem config deleted, stopping all tunnels");
                self.manager.stop_all(state, TUNNEL_STOPPED).await;
                for (_, conn) in self.manager.registry().drain().await {
                    conn.shutdown();
                }
                state.reset();
                self.manager.publisher().delete(&StatePath::Root);
                self.publish_root(state);
            }
        }
    }

    async fn set_root_admin(&self, state: &mut DesiredState, admin_state: AdminState) {
        state.root.admin_state = admin_state;
        match (admin_state, state.root.oper_state) {
            (AdminState::Disable, OperState::Up) => {
                tracing::info!("Subsystem disabled, stopping all tunnels");
                self.manager.stop_all(state, ADMIN_DOWN).await;
                state.root.oper_state = OperState::Down;
            }
            (AdminState::Enable, oper_state) if oper_state != OperState::Up => {
                tracing::info!("Subsystem enabled, starting all tunnels");
                state.root.oper_state = OperState::Up;
                self.manager.start_all(state).await;
            }
            _ => {}
        }
        self.publish_root(state);
    }

    async fn apply_destination(&self, state: &mut DesiredState, name: &str, change: Change<Destination>) {
        match change {
            Change::Create(destination) | Change::Update(destination) => {
                publish_document(
                    self.manager.publisher().as_ref(),
                    &StatePath::destination(name),
                    DestinationDocument::from(&destination),
                );
                state.destinations.insert(name.to_string(), destination);

                // associations that arrived before their destination
                let waiting: Vec<String> = state
                    .tunnels
                    .iter()
                    .filter(|(_, tunnel)| {
                        tunnel
                            .destinations
                            .get(name)
                            .map(|assoc| assoc.down_reason == DESTINATION_NOT_CONFIGURED)
                            .unwrap_or(false)
                    })
                    .map(|(tunnel, _)| tunnel.clone())
                    .collect();
                for tunnel in waiting {
                    self.manager
                        .start_tunnel_destination(state, &tunnel, name)
                        .await;
                }
            }
            Change::Delete => {
                state.destinations.remove(name);
                self.manager
                    .publisher()
                    .delete(&StatePath::destination(name));
            }
        }
    }

    async fn apply_tunnel(&self, state: &mut DesiredState, name: &str, change: Change<TunnelSpec>) {
        match change {
            Change::Create(spec) => self.create_tunnel(state, name, spec).await,
            Change::Update(spec) => {
                if state.tunnel(name).is_none() {
                    return self.create_tunnel(state, name, spec).await;
                }
                let Some(tunnel) = state.tunnel_mut(name) else {
                    return;
                };
                let oper_state = tunnel.oper_state;
                tunnel.admin_state = spec.admin_state;
                tunnel.description = spec.description;
                tracing::info!(
                    "Tunnel {}: admin state {}, oper state {}",
                    name,
                    spec.admin_state,
                    oper_state
                );

                match (spec.admin_state, oper_state) {
                    (AdminState::Enable, current) if current != OperState::Up => {
                        if let Err(e) = self.manager.start_tunnel(state, name).await {
                            tracing::error!("Failed to start tunnel {}: {}", name, e);
                        }
                    }
                    (AdminState::Disable, current) if current != OperState::Down => {
                        self.manager.stop_tunnel(state, name, ADMIN_DOWN).await;
                    }
                    _ => {}
                }
                self.publish_tunnel(state, name);
            }
            Change::Delete => {
                self.manager.stop_tunnel(state, name, TUNNEL_STOPPED).await;
                state.tunnels.remove(name);
                self.manager.publisher().delete(&StatePath::tunnel(name));
            }
        }
    }

    /// Insert the tunnel, keeping targets and associations that arrived
    /// first, and derive its oper state.
    async fn create_tunnel(&self, state: &mut DesiredState, name: &str, spec: TunnelSpec) {
        let tunnel = state.tunnel_entry(name);
        tunnel.admin_state = spec.admin_state;
        tunnel.description = spec.description;

        if !state.may_run(name) {
            self.manager.stop_tunnel(state, name, ADMIN_DOWN).await;
        } else if let Err(e) = self.manager.start_tunnel(state, name).await {
            tracing::info!("Tunnel {} not started: {}", name, e);
        }
        self.publish_tunnel(state, name);
    }

    async fn apply_tunnel_destination(&self, state: &mut DesiredState, tunnel: &str, destination: &str, change: Change<()>) {
        match change {
            Change::Create(()) => {
                state
                    .tunnel_entry(tunnel)
                    .destinations
                    .entry(destination.to_string())
                    .or_default();

                if !state.destinations.contains_key(destination) {
                    tracing::warn!(
                        "Tunnel {} references unknown destination {}",
                        tunnel,
                        destination
                    );
                }
                if state.may_run(tunnel) {
                    self.manager
                        .start_tunnel_destination(state, tunnel, destination)
                        .await;
                } else if let Some(assoc) = state.association_mut(tunnel, destination) {
                    if assoc.oper_state == OperState::Down && assoc.down_reason.is_empty() {
                        assoc.down_reason = ADMIN_DOWN.to_string();
                    }
                }
                self.publish_association(state, tunnel, destination);
            }
            Change::Update(()) => {}
            Change::Delete => {
                self.manager
                    .stop_tunnel_destination(state, tunnel, destination, TUNNEL_STOPPED)
                    .await;
                if let Some(t) = state.tunnel_mut(tunnel) {
                    t.destinations.remove(destination);
                }
                self.manager
                    .publisher()
                    .delete(&StatePath::association(tunnel, destination));
            }
        }
    }

    async fn apply_tunnel_target(&self, state: &mut DesiredState, tunnel: &str, target: &str, change: Change<TargetConfig>) {
        match change {
            Change::Create(config) | Change::Update(config) => {
                let previous = state
                    .tunnel_entry(tunnel)
                    .targets
                    .insert(target.to_string(), config.clone());
                publish_document(
                    self.manager.publisher().as_ref(),
                    &StatePath::tunnel_target(tunnel, target),
                    TargetDocument::from(&config),
                );

                if previous.is_some() {
                    self.manager
                        .deregister_tunnel_target(state, tunnel, target)
                        .await;
                }
                self.manager
                    .register_tunnel_target(state, tunnel, target)
                    .await;
            }
            Change::Delete => {
                self.manager
                    .deregister_tunnel_target(state, tunnel, target)
                    .await;
                if let Some(t) = state.tunnel_mut(tunnel) {
                    t.targets.remove(target);
                }
                self.manager
                    .publisher()
                    .delete(&StatePath::tunnel_target(tunnel, target));
            }
        }
    }

    fn publish_root(&self, state: &DesiredState) {
        publish_document(
            self.manager.publisher().as_ref(),
            &StatePath::Root,
            RootDocument::from(&state.root),
        );
    }

    fn publish_tunnel(&self, state: &DesiredState, name: &str) {
        if let Some(tunnel) = state.tunnel(name) {
            publish_document(
                self.manager.publisher().as_ref(),
                &StatePath::tunnel(name),
                TunnelDocument::from(tunnel),
            );
        }
    }

    fn publish_association(&self, state: &DesiredState, tunnel: &str, destination: &str) {
        if let Some(assoc) = state
            .tunnel(tunnel)
            .and_then(|t| t.destinations.get(destination))
        {
            publish_document(
                self.manager.publisher().as_ref(),
                &StatePath::association(tunnel, destination),
                AssociationDocument::from(assoc),
            );
        }
    }
}
