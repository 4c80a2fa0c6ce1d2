//! Target identity as seen by the tunnel server

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when a target is flattened into a single state key
pub const TARGET_KEY_SEPARATOR: &str = ":::";

/// A locally reachable service advertised through a tunnel.
///
/// The tunnel server addresses targets by the `(id, type)` pair only; how
/// the agent reaches the service locally is never sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// Target identity (node name, MAC address, ...)
    pub id: String,
    /// Target type tag (e.g. `GNMI_GNOI`, `SSH`)
    #[serde(rename = "type")]
    pub kind: String,
}

impl Target {
    /// Create a new target
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }

    /// Flattened `"<id>:::<type>"` key
    pub fn key(&self) -> String {
        format!("{}{}{}", self.id, TARGET_KEY_SEPARATOR, self.kind)
    }

    /// Inverse of [`Target::key`]
    pub fn from_key(key: &str) -> Option<Self> {
        key.split_once(TARGET_KEY_SEPARATOR)
            .map(|(id, kind)| Self::new(id, kind))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.kind)
    }
}
