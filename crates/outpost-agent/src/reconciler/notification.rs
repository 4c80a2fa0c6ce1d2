//! Raw change notifications

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::paths::COMMIT_END_PATH;

/// Operation carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One path-keyed change, as delivered by the config transport
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeNotification {
    pub path: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "unknown_operation")]
    pub op: Operation,
    /// Payload; a JSON-encoded string is decoded in place
    #[serde(default, deserialize_with = "embedded_json")]
    pub data: Option<Value>,
}

fn unknown_operation() -> Operation {
    Operation::Unknown
}

fn embedded_json<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(text)),
        },
        other => other,
    })
}

impl ChangeNotification {
    pub fn new(path: impl Into<String>, keys: &[&str], op: Operation, data: Option<Value>) -> Self {
        Self {
            path: path.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            op,
            data,
        }
    }

    pub fn create(path: &str, keys: &[&str], data: Value) -> Self {
        Self::new(path, keys, Operation::Create, Some(data))
    }

    pub fn update(path: &str, keys: &[&str], data: Value) -> Self {
        Self::new(path, keys, Operation::Update, Some(data))
    }

    pub fn delete(path: &str, keys: &[&str]) -> Self {
        Self::new(path, keys, Operation::Delete, None)
    }

    /// The marker that applies everything buffered so far
    pub fn commit() -> Self {
        Self::new(COMMIT_END_PATH, &[], Operation::Create, None)
    }

    pub fn is_commit(&self) -> bool {
        self.path == COMMIT_END_PATH
    }
}
