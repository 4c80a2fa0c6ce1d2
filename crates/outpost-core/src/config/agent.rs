//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Local management API socket dialed by `grpc_server` targets
pub const DEFAULT_GRPC_SERVER_ADDRESS: &str = "unix:///opt/srlinux/var/run/sr_gnmi_server";

/// Local shell service dialed by `ssh_server` targets
pub const DEFAULT_SSH_SERVER_ADDRESS: &str = "localhost:22";

/// Configuration for the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name the agent registers under with tunnel servers
    pub agent_name: String,

    /// Bound on a single dial attempt, TLS handshake included
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Fixed wait between failed dial attempts
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,

    /// Network instance used when a destination names none
    pub default_network_instance: String,

    /// Prefix turning a network instance name into a namespace name
    pub namespace_prefix: String,

    /// Directory holding named network namespaces
    pub netns_dir: PathBuf,

    /// Dial tunnel servers inside the destination's network namespace.
    ///
    /// When false, every dial happens in the agent's own namespace.
    pub use_namespaces: bool,

    /// Platform tag embedded in the `user_agent` target identity
    pub platform_tag: String,

    /// Default dial address for `grpc_server` targets
    pub grpc_server_address: String,

    /// Default dial address for `ssh_server` targets
    pub ssh_server_address: String,

    /// Optional TOML file overriding discovered system identity fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "grpc-tunnel".to_string(),
            dial_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
            default_network_instance: "mgmt".to_string(),
            namespace_prefix: "srbase-".to_string(),
            netns_dir: PathBuf::from("/var/run/netns"),
            use_namespaces: true,
            platform_tag: "nokia-srl".to_string(),
            grpc_server_address: DEFAULT_GRPC_SERVER_ADDRESS.to_string(),
            ssh_server_address: DEFAULT_SSH_SERVER_ADDRESS.to_string(),
            identity_path: None,
        }
    }
}

impl AgentConfig {
    /// Namespace name for a destination's network instance
    pub fn namespace_name(&self, network_instance: Option<&str>) -> String {
        let instance = network_instance
            .filter(|ni| !ni.is_empty())
            .unwrap_or(&self.default_network_instance);
        format!("{}{}", self.namespace_prefix, instance)
    }
}
