//! Target identity resolution
//!
//! Turns a [`TargetConfig`] into the `(id, type)` pair announced to the
//! tunnel server plus the local address inbound streams are bridged to.
//! Custom selectors are tera templates rendered against [`SystemInfo`].

use std::error::Error as _;

use tera::{Context, Tera};

use outpost_core::config::AgentConfig;
use outpost_core::error::TargetError;
use outpost_core::SystemInfo;
use outpost_protocol::Target;

use crate::tree::{IdSelector, TargetConfig, TypeSelector};

/// Type tag of the structured-config API target
pub const GRPC_SERVER_TYPE: &str = "GNMI_GNOI";

/// Type tag of the shell service target
pub const SSH_SERVER_TYPE: &str = "SSH";

/// A resolved target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDetails {
    pub id: String,
    pub kind: String,
    /// `host:port`, or `unix://<path>` for a domain socket
    pub dial_address: String,
}

impl TargetDetails {
    pub fn target(&self) -> Target {
        Target::new(&self.id, &self.kind)
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.id == target.id && self.kind == target.kind
    }
}

/// Resolves target configs against the local system identity
#[derive(Debug, Clone)]
pub struct TargetResolver {
    system: SystemInfo,
    platform_tag: String,
    grpc_server_address: String,
    ssh_server_address: String,
}

impl TargetResolver {
    pub fn new(system: SystemInfo, config: &AgentConfig) -> Self {
        Self {
            system,
            platform_tag: config.platform_tag.clone(),
            grpc_server_address: config.grpc_server_address.clone(),
            ssh_server_address: config.ssh_server_address.clone(),
        }
    }

    /// `"<hostname>:<platform tag>:<version>"`
    pub fn user_agent(&self) -> String {
        format!(
            "{}:{}:{}",
            self.system.name, self.platform_tag, self.system.version
        )
    }

    pub fn resolve(&self, config: &TargetConfig) -> Result<TargetDetails, TargetError> {
        let id = match config.id.as_ref().ok_or(TargetError::NoIdentity)? {
            IdSelector::MacAddress => self.system.chassis_mac_address.clone(),
            IdSelector::UserAgent => self.user_agent(),
            IdSelector::NodeName => self.system.name.clone(),
            IdSelector::Custom(template) => self.render("customID", template)?,
        };

        let override_address = config.local_address.clone();
        let (kind, dial_address) = match config.kind.as_ref().ok_or(TargetError::NoType)? {
            TypeSelector::GrpcServer => (
                GRPC_SERVER_TYPE.to_string(),
                override_address.unwrap_or_else(|| self.grpc_server_address.clone()),
            ),
            TypeSelector::SshServer => (
                SSH_SERVER_TYPE.to_string(),
                override_address.unwrap_or_else(|| self.ssh_server_address.clone()),
            ),
            TypeSelector::Custom(template) => (
                self.render("customType", template)?,
                override_address.ok_or(TargetError::MissingLocalAddress)?,
            ),
        };

        Ok(TargetDetails {
            id,
            kind,
            dial_address,
        })
    }

    fn render(&self, selector: &str, template: &str) -> Result<String, TargetError> {
        let failed = |e: tera::Error| TargetError::Template {
            selector: selector.to_string(),
            message: describe(&e),
        };

        let context = Context::from_serialize(&self.system).map_err(failed)?;
        let mut tera = Tera::default();
        tera.add_raw_template(selector, template).map_err(failed)?;
        tera.render(selector, &context).map_err(failed)
    }
}

/// Tera's top-level message is generic; the cause is in the source chain
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TargetResolver {
        let system = SystemInfo {
            name: "leaf1".to_string(),
            version: "v24.3.1".to_string(),
            chassis_type: "7220 IXR-D2L".to_string(),
            chassis_mac_address: "1A:2B:3C:4D:5E:6F".to_string(),
            chassis_serial_number: "NS123".to_string(),
            ..SystemInfo::default()
        };
        TargetResolver::new(system, &AgentConfig::default())
    }

    fn config(id: IdSelector, kind: TypeSelector) -> TargetConfig {
        TargetConfig {
            id: Some(id),
            kind: Some(kind),
            local_address: None,
        }
    }

    #[test]
    fn test_node_name_grpc_server() {
        let details = resolver()
            .resolve(&config(IdSelector::NodeName, TypeSelector::GrpcServer))
            .unwrap();
        assert_eq!(details.id, "leaf1");
        assert_eq!(details.kind, "GNMI_GNOI");
        assert_eq!(details.dial_address, outpost_core::config::DEFAULT_GRPC_SERVER_ADDRESS);
        assert_eq!(details.target().key(), "leaf1:::GNMI_GNOI");
    }

    #[test]
    fn test_mac_and_user_agent_identities() {
        let resolver = resolver();
        let mac = resolver
            .resolve(&config(IdSelector::MacAddress, TypeSelector::SshServer))
            .unwrap();
        assert_eq!(mac.id, "1A:2B:3C:4D:5E:6F");
        assert_eq!(mac.dial_address, "localhost:22");

        let agent = resolver
            .resolve(&config(IdSelector::UserAgent, TypeSelector::SshServer))
            .unwrap();
        assert_eq!(agent.id, "leaf1:nokia-srl:v24.3.1");
    }

    #[test]
    fn test_local_address_override() {
        let mut target = config(IdSelector::NodeName, TypeSelector::SshServer);
        target.local_address = Some("10.1.1.1:2222".to_string());
        let details = resolver().resolve(&target).unwrap();
        assert_eq!(details.dial_address, "10.1.1.1:2222");
    }

    #[test]
    fn test_custom_templates() {
        let mut target = config(
            IdSelector::Custom("{{ name }}-{{ chassis_serial_number }}".to_string()),
            TypeSelector::Custom("NETCONF_{{ version }}".to_string()),
        );
        target.local_address = Some("unix:///run/netconf.sock".to_string());

        let details = resolver().resolve(&target).unwrap();
        assert_eq!(details.id, "leaf1-NS123");
        assert_eq!(details.kind, "NETCONF_v24.3.1");
        assert_eq!(details.dial_address, "unix:///run/netconf.sock");
    }

    #[test]
    fn test_custom_type_requires_local_address() {
        let target = config(IdSelector::NodeName, TypeSelector::Custom("X".to_string()));
        assert!(matches!(
            resolver().resolve(&target),
            Err(TargetError::MissingLocalAddress)
        ));
    }

    #[test]
    fn test_template_errors() {
        let unclosed = config(
            IdSelector::Custom("{{ name".to_string()),
            TypeSelector::SshServer,
        );
        assert!(matches!(
            resolver().resolve(&unclosed),
            Err(TargetError::Template { ref selector, .. }) if selector == "customID"
        ));

        let unknown_field = config(
            IdSelector::Custom("{{ hostname }}".to_string()),
            TypeSelector::SshServer,
        );
        assert!(matches!(
            resolver().resolve(&unknown_field),
            Err(TargetError::Template { .. })
        ));
    }

    #[test]
    fn test_missing_selectors() {
        let resolver = resolver();
        let no_id = TargetConfig {
            kind: Some(TypeSelector::SshServer),
            ..TargetConfig::default()
        };
        assert!(matches!(resolver.resolve(&no_id), Err(TargetError::NoIdentity)));

        let no_type = TargetConfig {
            id: Some(IdSelector::NodeName),
            ..TargetConfig::default()
        };
        assert!(matches!(resolver.resolve(&no_type), Err(TargetError::NoType)));
    }
}
