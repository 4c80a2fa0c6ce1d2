//! Local system identity
//!
//! Target identities are derived from this record: `node_name` uses the
//! hostname, `mac_address` the chassis MAC, and custom templates may render
//! any field by its snake_case name (`{{ chassis_serial_number }}`).
//!
//! Discovery reads what the host exposes; an optional TOML file then
//! overrides individual fields, which is how chassis data that the OS
//! cannot see (CLEI code, part number) gets supplied.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Read-only identity record supplied to target resolution at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub chassis_type: String,
    pub chassis_mac_address: String,
    pub chassis_clei_code: String,
    pub chassis_part_number: String,
    pub chassis_serial_number: String,
    pub ip_addr_v4: String,
    pub ip_addr_v6: String,
}

/// Field overrides read from the identity file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IdentityOverlay {
    name: Option<String>,
    version: Option<String>,
    chassis_type: Option<String>,
    chassis_mac_address: Option<String>,
    chassis_clei_code: Option<String>,
    chassis_part_number: Option<String>,
    chassis_serial_number: Option<String>,
    ip_addr_v4: Option<String>,
    ip_addr_v6: Option<String>,
}

impl SystemInfo {
    /// Discover identity from the running host.
    pub fn discover() -> Self {
        let info = Self {
            name: gethostname::gethostname().to_string_lossy().into_owned(),
            version: sysinfo::System::os_version().unwrap_or_default(),
            chassis_type: std::env::consts::ARCH.to_string(),
            chassis_mac_address: first_hardware_address().unwrap_or_default(),
            ..Self::default()
        };
        tracing::debug!("Discovered system identity: {:?}", info);
        info
    }

    /// Discover identity, then apply overrides from `overlay` if given.
    pub fn load(overlay: Option<&Path>) -> Result<Self, ConfigError> {
        let mut info = Self::discover();
        if let Some(path) = overlay {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            let content = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Invalid(format!("Failed to read identity: {}", e)))?;
            info.apply_overlay(&content)?;
        }
        Ok(info)
    }

    /// Override fields with the values set in a TOML document.
    pub fn apply_overlay(&mut self, content: &str) -> Result<(), ConfigError> {
        let overlay: IdentityOverlay = toml::from_str(content)?;

        let fields = [
            (&mut self.name, overlay.name),
            (&mut self.version, overlay.version),
            (&mut self.chassis_type, overlay.chassis_type),
            (&mut self.chassis_mac_address, overlay.chassis_mac_address),
            (&mut self.chassis_clei_code, overlay.chassis_clei_code),
            (&mut self.chassis_part_number, overlay.chassis_part_number),
            (&mut self.chassis_serial_number, overlay.chassis_serial_number),
            (&mut self.ip_addr_v4, overlay.ip_addr_v4),
            (&mut self.ip_addr_v6, overlay.ip_addr_v6),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
        Ok(())
    }
}

/// MAC address of the first non-loopback interface, by name order
fn first_hardware_address() -> Option<String> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks
        .list()
        .iter()
        .filter(|(name, data)| name.as_str() != "lo" && data.mac_address().0 != [0u8; 6])
        .collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));
    interfaces
        .first()
        .map(|(_, data)| data.mac_address().to_string())
}
