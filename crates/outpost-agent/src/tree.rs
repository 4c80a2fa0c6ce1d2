//! Desired-state tree
//!
//! Declared configuration plus the operational state derived from it, one
//! map per level: destinations and tunnels by name, then per tunnel its
//! target configs and destination associations. The tree has no locking of
//! its own; the agent keeps it behind a single async mutex.

use std::collections::BTreeMap;

use outpost_core::{AdminState, OperState};

/// Subsystem-wide admin intent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootConfig {
    pub admin_state: AdminState,
    pub oper_state: OperState,
}

/// An external tunnel server endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub address: String,
    pub port: String,
    pub description: String,
    pub no_tls: bool,
    pub tls_profile: String,
    /// Network instance to dial from; the agent default applies when unset
    pub network_instance: Option<String>,
}

impl Destination {
    /// `host:port` of the tunnel server, with IPv6 literals bracketed
    pub fn server_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// How a target's identity is derived, in precedence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelector {
    MacAddress,
    UserAgent,
    NodeName,
    Custom(String),
}

/// How a target's type and default dial address are derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSelector {
    GrpcServer,
    SshServer,
    Custom(String),
}

/// A target as configured on a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetConfig {
    pub id: Option<IdSelector>,
    pub kind: Option<TypeSelector>,
    pub local_address: Option<String>,
}

/// Operational state of one registered target on one association
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    pub oper_state: OperState,
    pub down_reason: String,
}

/// Runtime state of a tunnel's link to one destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationAssoc {
    pub oper_state: OperState,
    pub down_reason: String,
    /// Keyed by `"<id>:::<type>"`
    pub targets: BTreeMap<String, TargetState>,
}

impl DestinationAssoc {
    pub fn set_state(&mut self, state: OperState, reason: impl Into<String>) {
        self.oper_state = state;
        self.down_reason = reason.into();
    }
}

/// A named tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tunnel {
    pub admin_state: AdminState,
    pub oper_state: OperState,
    pub down_reason: String,
    pub description: String,
    /// Target configs by name
    pub targets: BTreeMap<String, TargetConfig>,
    /// Associations by destination name
    pub destinations: BTreeMap<String, DestinationAssoc>,
}

impl Tunnel {
    pub fn set_state(&mut self, state: OperState, reason: impl Into<String>) {
        self.oper_state = state;
        self.down_reason = reason.into();
    }
}

/// The whole declared tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub root: RootConfig,
    pub destinations: BTreeMap<String, Destination>,
    pub tunnels: BTreeMap<String, Tunnel>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tunnel is allowed to hold connections right now
    pub fn may_run(&self, tunnel: &str) -> bool {
        self.root.admin_state.is_enabled()
            && self
                .tunnels
                .get(tunnel)
                .map(|t| t.admin_state.is_enabled())
                .unwrap_or(false)
    }

    pub fn tunnel(&self, name: &str) -> Option<&Tunnel> {
        self.tunnels.get(name)
    }

    pub fn tunnel_mut(&mut self, name: &str) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(name)
    }

    /// The tunnel, created with defaults if a child path arrived first
    pub fn tunnel_entry(&mut self, name: &str) -> &mut Tunnel {
        self.tunnels.entry(name.to_string()).or_default()
    }

    pub fn association_mut(&mut self, tunnel: &str, destination: &str) -> Option<&mut DestinationAssoc> {
        self.tunnels
            .get_mut(tunnel)
            .and_then(|t| t.destinations.get_mut(destination))
    }

    /// Reset to an empty, disabled tree
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
