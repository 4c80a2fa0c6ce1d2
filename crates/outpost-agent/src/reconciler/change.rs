//! Typed configuration changes
//!
//! A [`ChangeNotification`] is decoded exactly once into a [`ConfigChange`]:
//! the path selects the case, the keys name the entity and the payload is
//! decoded into that case's concrete type.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use outpost_core::AdminState;

use super::notification::{ChangeNotification, Operation};
use super::paths::{
    DESTINATION_PATH, ROOT_PATH, TUNNEL_DESTINATION_PATH, TUNNEL_PATH, TUNNEL_TARGET_PATH,
};
use crate::schema::{DestinationDocument, RootDocument, TargetDocument, TunnelDocument};
use crate::tree::{Destination, TargetConfig};

/// What happens to one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Create(T),
    Update(T),
    Delete,
}

/// Operator-settable tunnel fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub admin_state: AdminState,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Root(Change<AdminState>),
    Destination {
        name: String,
        change: Change<Destination>,
    },
    Tunnel {
        name: String,
        change: Change<TunnelSpec>,
    },
    TunnelDestination {
        tunnel: String,
        destination: String,
        change: Change<()>,
    },
    TunnelTarget {
        tunnel: String,
        target: String,
        change: Change<TargetConfig>,
    },
}

/// Why a notification could not be turned into a change
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected config path {0:?}")]
    UnknownPath(String),

    #[error("unsupported operation on {0:?}")]
    UnknownOperation(String),

    #[error("unexpected number of keys in path {path:?}: expected {expected}, got {got:?}")]
    KeyCount {
        path: String,
        expected: usize,
        got: Vec<String>,
    },

    #[error("failed to decode payload of {path:?}: {source}")]
    Payload {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigChange {
    pub fn decode(notification: &ChangeNotification) -> Result<Self, DecodeError> {
        let path = notification.path.as_str();
        match path {
            ROOT_PATH => {
                keys::<0>(notification)?;
                let change = decode_change(notification, |doc: RootDocument| doc.admin_state)?;
                Ok(ConfigChange::Root(change))
            }
            DESTINATION_PATH => {
                let [name] = keys::<1>(notification)?;
                let change = decode_change(notification, |doc: DestinationDocument| {
                    Destination::from(doc)
                })?;
                Ok(ConfigChange::Destination { name, change })
            }
            TUNNEL_PATH => {
                let [name] = keys::<1>(notification)?;
                let change = decode_change(notification, |doc: TunnelDocument| TunnelSpec {
                    admin_state: doc.tunnel.admin_state,
                    description: doc.tunnel.description.value,
                })?;
                Ok(ConfigChange::Tunnel { name, change })
            }
            TUNNEL_DESTINATION_PATH => {
                let [tunnel, destination] = keys::<2>(notification)?;
                let change = decode_change(notification, |_: Value| ())?;
                Ok(ConfigChange::TunnelDestination {
                    tunnel,
                    destination,
                    change,
                })
            }
            TUNNEL_TARGET_PATH => {
                let [tunnel, target] = keys::<2>(notification)?;
                let change = decode_change(notification, |doc: TargetDocument| {
                    TargetConfig::from(doc)
                })?;
                Ok(ConfigChange::TunnelTarget {
                    tunnel,
                    target,
                    change,
                })
            }
            other => Err(DecodeError::UnknownPath(other.to_string())),
        }
    }
}

fn keys<const N: usize>(notification: &ChangeNotification) -> Result<[String; N], DecodeError> {
    <[String; N]>::try_from(notification.keys.clone()).map_err(|got| DecodeError::KeyCount {
        path: notification.path.clone(),
        expected: N,
        got,
    })
}

fn decode_change<D, T>(notification: &ChangeNotification, convert: impl FnOnce(D) -> T) -> Result<Change<T>, DecodeError>
where
    D: DeserializeOwned,
{
    let payload = || -> Result<T, DecodeError> {
        let data = notification
            .data
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let doc = serde_json::from_value(data).map_err(|source| DecodeError::Payload {
            path: notification.path.clone(),
            source,
        })?;
        Ok(convert(doc))
    };

    match notification.op {
        Operation::Create => Ok(Change::Create(payload()?)),
        Operation::Update => Ok(Change::Update(payload()?)),
        Operation::Delete => Ok(Change::Delete),
        Operation::Unknown => Err(DecodeError::UnknownOperation(notification.path.clone())),
    }
}
