//! Operational-state mirror
//!
//! Every state transition is mirrored to a [`StatePublisher`] as a full
//! document under a structured path. A delete removes the keyed subtree.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use outpost_protocol::Target;

use crate::reconciler::paths::{DESTINATION_PATH, ROOT_PATH, TUNNEL_PATH};

/// Where a state document lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatePath {
    Root,
    Destination {
        name: String,
    },
    Tunnel {
        name: String,
    },
    TunnelTarget {
        tunnel: String,
        target: String,
    },
    Association {
        tunnel: String,
        destination: String,
    },
    TargetState {
        tunnel: String,
        destination: String,
        target: Target,
    },
}

impl StatePath {
    pub fn destination(name: &str) -> Self {
        StatePath::Destination {
            name: name.to_string(),
        }
    }

    pub fn tunnel(name: &str) -> Self {
        StatePath::Tunnel {
            name: name.to_string(),
        }
    }

    pub fn tunnel_target(tunnel: &str, target: &str) -> Self {
        StatePath::TunnelTarget {
            tunnel: tunnel.to_string(),
            target: target.to_string(),
        }
    }

    pub fn association(tunnel: &str, destination: &str) -> Self {
        StatePath::Association {
            tunnel: tunnel.to_string(),
            destination: destination.to_string(),
        }
    }

    pub fn target_state(tunnel: &str, destination: &str, target: &Target) -> Self {
        StatePath::TargetState {
            tunnel: tunnel.to_string(),
            destination: destination.to_string(),
            target: target.clone(),
        }
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatePath::Root => write!(f, "{}", ROOT_PATH),
            StatePath::Destination { name } => {
                write!(f, "{}{{.name==\"{}\"}}", DESTINATION_PATH, name)
            }
            StatePath::Tunnel { name } => write!(f, "{}{{.name==\"{}\"}}", TUNNEL_PATH, name),
            StatePath::TunnelTarget { tunnel, target } => write!(
                f,
                "{}{{.name==\"{}\"}}.target{{.name==\"{}\"}}",
                TUNNEL_PATH, tunnel, target
            ),
            StatePath::Association {
                tunnel,
                destination,
            } => write!(
                f,
                "{}{{.name==\"{}\"}}.destination{{.name==\"{}\"}}",
                TUNNEL_PATH, tunnel, destination
            ),
            StatePath::TargetState {
                tunnel,
                destination,
                target,
            } => write!(
                f,
                "{}{{.name==\"{}\"}}.destination{{.name==\"{}\"}}.target{{.id==\"{}\"&&.type==\"{}\"}}",
                TUNNEL_PATH, tunnel, destination, target.id, target.kind
            ),
        }
    }
}

/// Sink for operational state
pub trait StatePublisher: Send + Sync {
    /// Create or fully replace the document at `path`
    fn publish(&self, path: &StatePath, document: Value);

    /// Remove the document at `path` and everything below it
    fn delete(&self, path: &StatePath);
}

/// Serialize `document` and publish it; serialization failures are logged.
pub fn publish_document<T: Serialize>(publisher: &dyn StatePublisher, path: &StatePath, document: T) {
    match serde_json::to_value(document) {
        Ok(value) => publisher.publish(path, value),
        Err(e) => tracing::error!("Failed to encode state for {}: {}", path, e),
    }
}

/// Publishes state as structured log records
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn publish(&self, path: &StatePath, document: Value) {
        tracing::info!(path = %path, state = %document, "state updated");
    }

    fn delete(&self, path: &StatePath) {
        tracing::info!(path = %path, "state deleted");
    }
}

/// Keeps the latest document per path in memory
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    documents: DashMap<String, Value>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &StatePath) -> Option<Value> {
        self.documents.get(&path.to_string()).map(|doc| doc.value().clone())
    }

    pub fn contains(&self, path: &StatePath) -> bool {
        self.documents.contains_key(&path.to_string())
    }

    /// Ordered copy of every document
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Paths at or below `path`
    pub fn paths_under(&self, path: &StatePath) -> Vec<String> {
        let root = path.to_string();
        let prefix = format!("{}.", root);
        let mut paths: Vec<String> = self
            .documents
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| *key == root || key.starts_with(&prefix))
            .collect();
        paths.sort();
        paths
    }
}

impl StatePublisher for MemoryPublisher {
    fn publish(&self, path: &StatePath, document: Value) {
        self.documents.insert(path.to_string(), document);
    }

    fn delete(&self, path: &StatePath) {
        let root = path.to_string();
        let prefix = format!("{}.", root);
        self.documents
            .retain(|key, _| *key != root && !key.starts_with(&prefix));
    }
}
