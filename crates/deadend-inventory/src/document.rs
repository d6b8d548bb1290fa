//! The Ansible dynamic inventory document.
//!
//! ```json
//! {
//!     "_meta": {"hostvars": {"<hostname>": {"ansible_...": "..."}}},
//!     "<group>": {"hosts": ["<hostname>", "..."], "vars": {}}
//! }
//! ```
//!
//! Every map is ordered and the rendering uses four-space indentation, so
//! identical input yields byte-identical output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

use crate::provision::{HostRecord, Provisioned};
use crate::Result;

/// Per-host variables of the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Host records by hostname.
    pub hostvars: BTreeMap<String, HostRecord>,
}

/// A host group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Sorted member hostnames.
    pub hosts: Vec<String>,
    /// Group variables, always empty.
    pub vars: BTreeMap<String, serde_json::Value>,
}

/// A complete inventory document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Host variables.
    #[serde(rename = "_meta")]
    pub meta: Meta,
    /// Groups by name.
    #[serde(flatten)]
    pub groups: BTreeMap<String, Group>,
}

impl Inventory {
    /// Look up the variables of a host.
    #[must_use]
    pub fn host(&self, hostname: &str) -> Option<&HostRecord> {
        self.meta.hostvars.get(hostname)
    }

    /// Render as pretty JSON with sorted keys at every level.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let value = sort_keys(serde_json::to_value(self)?);
        let mut buf = Vec::new();
        let mut ser =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        value.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Rebuild every object with its keys in sorted order, including `_meta`.
fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

/// Assemble the inventory document from a provisioning pass.
#[must_use]
pub fn assemble(provisioned: Provisioned) -> Inventory {
    let groups = provisioned
        .groups
        .into_iter()
        .map(|(name, hosts)| {
            (
                name,
                Group {
                    hosts: hosts.into_iter().collect(),
                    vars: BTreeMap::new(),
                },
            )
        })
        .collect();

    Inventory {
        meta: Meta {
            hostvars: provisioned.hosts,
        },
        groups,
    }
}

/// The document returned when no listing was requested.
#[must_use]
pub fn empty_inventory() -> Inventory {
    Inventory::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn empty_inventory_renders_bare_meta() {
        let json = empty_inventory().to_json().unwrap();
        assert_eq!(json, "{\n    \"_meta\": {\n        \"hostvars\": {}\n    }\n}");
    }

    #[test]
    fn groups_are_sorted_with_empty_vars() {
        let provisioned = Provisioned {
            hosts: BTreeMap::new(),
            groups: BTreeMap::from([
                (
                    "fleet_a".to_string(),
                    BTreeSet::from(["fleet_a-z".to_string(), "fleet_a-b".to_string()]),
                ),
                ("Zone".to_string(), BTreeSet::new()),
            ]),
        };

        let inventory = assemble(provisioned);
        assert_eq!(inventory.groups["fleet_a"].hosts, vec!["fleet_a-b", "fleet_a-z"]);

        let json = inventory.to_json().unwrap();
        let zone = json.find("\"Zone\"").unwrap();
        let meta = json.find("\"_meta\"").unwrap();
        let fleet = json.find("\"fleet_a\"").unwrap();
        assert!(zone < meta && meta < fleet);
        assert!(json.contains("\"vars\": {}"));
    }

    fn record(name: &str, port: u16) -> HostRecord {
        HostRecord {
            ansible_connection: "deadend".to_string(),
            ansible_port: port,
            ansible_host: "localhost".to_string(),
            ansible_user: "pi".to_string(),
            ansible_sudo_pass: "pw".to_string(),
            ansible_become: "yes".to_string(),
            ansible_become_user: "root".to_string(),
            ansible_become_pass: "pw".to_string(),
            ansible_ssh_private_key_file: format!("inv/fleet-a/{name}.pem").into(),
            ansible_python_interpreter: "/usr/bin/python3".to_string(),
            ansible_ssh_retries: 20,
            ansible_kubectl_namespace: "fleet-a".to_string(),
            ansible_kubectl_context: Some("prod".to_string()),
            ansible_deadend_tunnel_port: Some(40001),
            ansible_deadend_tunnel_open: true,
            ansible_deadend_device: name.to_string(),
        }
    }

    fn fleet() -> Provisioned {
        Provisioned {
            hosts: BTreeMap::from([
                ("fleet_a-cam-02".to_string(), record("cam-02", 2201)),
                ("fleet_a-cam-01".to_string(), record("cam-01", 2200)),
            ]),
            groups: BTreeMap::from([
                (
                    "site_north".to_string(),
                    BTreeSet::from(["fleet_a-cam-02".to_string()]),
                ),
                (
                    "fleet_a".to_string(),
                    BTreeSet::from(["fleet_a-cam-02".to_string(), "fleet_a-cam-01".to_string()]),
                ),
            ]),
        }
    }

    #[test]
    fn rendering_is_reproducible() {
        let a = assemble(fleet()).to_json().unwrap();
        let b = assemble(fleet()).to_json().unwrap();
        assert_eq!(a, b);

        let connection = a.find("\"ansible_connection\"").unwrap();
        let user = a.find("\"ansible_user\"").unwrap();
        assert!(connection < user);
        assert!(a.find("\"fleet_a-cam-01\"").unwrap() < a.find("\"fleet_a-cam-02\"").unwrap());
        assert!(a.contains("\n            \"fleet_a-cam-01\": {\n                \"ansible_become\": \"yes\","));
    }
}
