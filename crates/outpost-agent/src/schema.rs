//! JSON documents exchanged with the config and state stores
//!
//! Leaves are wrapped as `{"value": ...}`. Payloads are decoded once into
//! these types and converted to tree types; state documents are built from
//! tree types and published as whole documents.

use serde::{Deserialize, Deserializer, Serialize};

use outpost_core::{AdminState, OperState};

use crate::tree::{
    DestinationAssoc, Destination, IdSelector, RootConfig, TargetConfig, TargetState, Tunnel,
    TypeSelector,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringValue {
    #[serde(default)]
    pub value: String,
}

impl StringValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    fn into_option(self) -> Option<String> {
        if self.value.is_empty() {
            None
        } else {
            Some(self.value)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolValue {
    #[serde(default)]
    pub value: bool,
}

impl BoolValue {
    fn is_false(&self) -> bool {
        !self.value
    }
}

/// Port as `{"value": "9100"}` or `{"value": 9100}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortValue {
    #[serde(default, deserialize_with = "string_or_number")]
    pub value: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Text(text) => text,
        Repr::Number(number) => number.to_string(),
    })
}

// --- root ---

/// `.system.grpc_tunnel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootDocument {
    pub admin_state: AdminState,
    #[serde(skip_deserializing)]
    pub oper_state: OperState,
}

impl From<&RootConfig> for RootDocument {
    fn from(root: &RootConfig) -> Self {
        Self {
            admin_state: root.admin_state,
            oper_state: root.oper_state,
        }
    }
}

// --- destination ---

/// `.system.grpc_tunnel.destination`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDocument {
    pub destination: DestinationBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationBody {
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub address: StringValue,
    #[serde(skip_serializing_if = "port_is_empty")]
    pub port: PortValue,
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub description: StringValue,
    #[serde(skip_serializing_if = "BoolValue::is_false")]
    pub no_tls: BoolValue,
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub tls_profile: StringValue,
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub network_instance: StringValue,
}

fn port_is_empty(port: &PortValue) -> bool {
    port.value.is_empty()
}

impl From<DestinationDocument> for Destination {
    fn from(doc: DestinationDocument) -> Self {
        let body = doc.destination;
        Self {
            address: body.address.value,
            port: body.port.value,
            description: body.description.value,
            no_tls: body.no_tls.value,
            tls_profile: body.tls_profile.value,
            network_instance: body.network_instance.into_option(),
        }
    }
}

impl From<&Destination> for DestinationDocument {
    fn from(dest: &Destination) -> Self {
        Self {
            destination: DestinationBody {
                address: StringValue::new(&dest.address),
                port: PortValue {
                    value: dest.port.clone(),
                },
                description: StringValue::new(&dest.description),
                no_tls: BoolValue {
                    value: dest.no_tls,
                },
                tls_profile: StringValue::new(&dest.tls_profile),
                network_instance: StringValue::new(
                    dest.network_instance.clone().unwrap_or_default(),
                ),
            },
        }
    }
}

// --- tunnel ---

/// `.system.grpc_tunnel.tunnel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDocument {
    pub tunnel: TunnelBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelBody {
    pub admin_state: AdminState,
    #[serde(skip_deserializing)]
    pub oper_state: OperState,
    #[serde(skip_deserializing, skip_serializing_if = "StringValue::is_empty")]
    pub oper_state_down_reason: StringValue,
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub description: StringValue,
}

impl From<&Tunnel> for TunnelDocument {
    fn from(tunnel: &Tunnel) -> Self {
        Self {
            tunnel: TunnelBody {
                admin_state: tunnel.admin_state,
                oper_state: tunnel.oper_state,
                oper_state_down_reason: StringValue::new(&tunnel.down_reason),
                description: StringValue::new(&tunnel.description),
            },
        }
    }
}

// --- tunnel destination ---

/// `.system.grpc_tunnel.tunnel.destination`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationDocument {
    #[serde(skip_deserializing)]
    pub oper_state: OperState,
    #[serde(skip_deserializing, skip_serializing_if = "StringValue::is_empty")]
    pub oper_state_down_reason: StringValue,
}

impl From<&DestinationAssoc> for AssociationDocument {
    fn from(assoc: &DestinationAssoc) -> Self {
        Self {
            oper_state: assoc.oper_state,
            oper_state_down_reason: StringValue::new(&assoc.down_reason),
        }
    }
}

// --- per-destination target state ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStateDocument {
    pub target: TargetStateBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStateBody {
    pub oper_state: OperState,
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub oper_state_down_reason: StringValue,
}

impl From<&TargetState> for TargetStateDocument {
    fn from(state: &TargetState) -> Self {
        Self {
            target: TargetStateBody {
                oper_state: state.oper_state,
                oper_state_down_reason: StringValue::new(&state.down_reason),
            },
        }
    }
}

// --- tunnel target ---

/// `.system.grpc_tunnel.tunnel.target`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDocument {
    pub target: TargetBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetBody {
    #[serde(skip_serializing_if = "StringValue::is_empty")]
    pub local_address: StringValue,
    pub id: IdBody,
    #[serde(rename = "type")]
    pub kind: TypeBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<BoolValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<BoolValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<BoolValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<StringValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_server: Option<BoolValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_server: Option<BoolValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<StringValue>,
}

fn is_set(flag: &Option<BoolValue>) -> bool {
    flag.map(|f| f.value).unwrap_or(false)
}

fn non_empty(text: &Option<StringValue>) -> Option<String> {
    text.as_ref()
        .filter(|t| !t.value.is_empty())
        .map(|t| t.value.clone())
}

impl From<TargetDocument> for TargetConfig {
    fn from(doc: TargetDocument) -> Self {
        let body = doc.target;

        // first match wins
        let id = if is_set(&body.id.mac_address) {
            Some(IdSelector::MacAddress)
        } else if is_set(&body.id.user_agent) {
            Some(IdSelector::UserAgent)
        } else if is_set(&body.id.node_name) {
            Some(IdSelector::NodeName)
        } else {
            non_empty(&body.id.custom).map(IdSelector::Custom)
        };

        let kind = if is_set(&body.kind.grpc_server) {
            Some(TypeSelector::GrpcServer)
        } else if is_set(&body.kind.ssh_server) {
            Some(TypeSelector::SshServer)
        } else {
            non_empty(&body.kind.custom).map(TypeSelector::Custom)
        };

        Self {
            id,
            kind,
            local_address: body.local_address.into_option(),
        }
    }
}

impl From<&TargetConfig> for TargetDocument {
    fn from(config: &TargetConfig) -> Self {
        let flag = Some(BoolValue { value: true });

        let mut id = IdBody::default();
        match &config.id {
            Some(IdSelector::MacAddress) => id.mac_address = flag,
            Some(IdSelector::UserAgent) => id.user_agent = flag,
            Some(IdSelector::NodeName) => id.node_name = flag,
            Some(IdSelector::Custom(template)) => id.custom = Some(StringValue::new(template)),
            None => {}
        }

        let mut kind = TypeBody::default();
        match &config.kind {
            Some(TypeSelector::GrpcServer) => kind.grpc_server = flag,
            Some(TypeSelector::SshServer) => kind.ssh_server = flag,
            Some(TypeSelector::Custom(template)) => kind.custom = Some(StringValue::new(template)),
            None => {}
        }

        Self {
            target: TargetBody {
                local_address: StringValue::new(config.local_address.clone().unwrap_or_default()),
                id,
                kind,
            },
        }
    }
}
