//! Credential provisioning.
//!
//! Turns a device listing into host records: decodes the login secrets,
//! caches the private key, derives groups and resolves the tunnel hint.
//! Devices without a usable username or password are skipped, but still
//! count as members of their groups.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use deadend_core::{
    decode_secret, hostname_for, label_group, namespace_group, DeadendConfig, DeviceKey,
    InventoryConfig,
};
use deadend_registry::{Device, DeviceRegistry, TunnelStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::credentials::CredentialCache;
use crate::{InventoryError, Result};

/// Connection parameters of one device, as consumed by Ansible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Connection plugin.
    pub ansible_connection: String,
    /// Sequential target port.
    pub ansible_port: u16,
    /// Always `localhost`; devices are reached through the bridge.
    pub ansible_host: String,
    /// Login user.
    pub ansible_user: String,
    /// Sudo password, same as the login password.
    pub ansible_sudo_pass: String,
    /// Always `yes`.
    pub ansible_become: String,
    /// Privilege escalation account.
    pub ansible_become_user: String,
    /// Become password, same as the login password.
    pub ansible_become_pass: String,
    /// Cached private key.
    pub ansible_ssh_private_key_file: PathBuf,
    /// Interpreter on the device.
    pub ansible_python_interpreter: String,
    /// Connect attempts per task.
    pub ansible_ssh_retries: u32,
    /// Namespace of the device record.
    pub ansible_kubectl_namespace: String,
    /// Kubeconfig context the record was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_kubectl_context: Option<String>,
    /// Tunnel port of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_deadend_tunnel_port: Option<u16>,
    /// Whether the tunnel is recorded as open.
    pub ansible_deadend_tunnel_open: bool,
    /// Device resource name.
    pub ansible_deadend_device: String,
}

impl HostRecord {
    /// The device this record was derived from.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or device fields are malformed.
    pub fn device_key(&self) -> std::result::Result<DeviceKey, deadend_core::IdError> {
        DeviceKey::new(
            self.ansible_kubectl_namespace.clone(),
            self.ansible_deadend_device.clone(),
        )
    }
}

/// Output of a provisioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provisioned {
    /// Host records by hostname.
    pub hosts: BTreeMap<String, HostRecord>,
    /// Group members by group name.
    pub groups: BTreeMap<String, BTreeSet<String>>,
}

/// Builds host records and caches credentials for a device listing.
pub struct CredentialProvisioner<R: ?Sized> {
    tunnels: Arc<TunnelStore<R>>,
    cache: CredentialCache,
    inventory: InventoryConfig,
    retries: u32,
    context: Option<String>,
}

impl<R: DeviceRegistry + ?Sized> CredentialProvisioner<R> {
    /// Create a provisioner writing keys below `config.inventory.cache_dir`.
    #[must_use]
    pub fn new(tunnels: Arc<TunnelStore<R>>, config: &DeadendConfig) -> Self {
        Self {
            tunnels,
            cache: CredentialCache::new(config.inventory.cache_dir.clone()),
            inventory: config.inventory.clone(),
            retries: config.connection.retries,
            context: config.registry.context.clone(),
        }
    }

    /// Record `context` as the kubeconfig context of every host.
    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// The tunnel store used for tunnel hints.
    #[must_use]
    pub const fn tunnels(&self) -> &Arc<TunnelStore<R>> {
        &self.tunnels
    }

    /// List every device in scope and provision it.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails or [`Self::provision`] fails.
    pub async fn provision_all(&self) -> Result<Provisioned> {
        let devices = self.tunnels.registry().list_devices().await?;
        self.provision(&devices)
    }

    /// The credential cache in use.
    #[must_use]
    pub const fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Provision every device of a listing.
    ///
    /// Devices are handled in `(namespace, name)` order so that target ports
    /// are stable for an unchanged fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cache cannot be written or target
    /// ports run out. Devices with missing credentials are skipped.
    pub fn provision(&self, devices: &[Device]) -> Result<Provisioned> {
        let mut keyed = Vec::with_capacity(devices.len());
        for device in devices {
            match device.key() {
                Ok(key) => keyed.push((key, device)),
                Err(e) => warn!(error = %e, "Skipping malformed device record"),
            }
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Provisioned::default();
        let mut next_port = Some(self.inventory.base_port);
        let mut claimed: BTreeMap<String, DeviceKey> = BTreeMap::new();

        for (key, device) in keyed {
            let hostname = hostname_for(&key);
            if let Some(owner) = claimed.get(&hostname) {
                warn!(
                    device = %key,
                    owner = %owner,
                    hostname = %hostname,
                    "Hostname already taken by another device, skipping"
                );
                continue;
            }
            claimed.insert(hostname.clone(), key.clone());

            out.groups
                .entry(namespace_group(key.namespace()))
                .or_default()
                .insert(hostname.clone());
            for (label, value) in device.labels() {
                out.groups
                    .entry(label_group(&label, &value))
                    .or_default()
                    .insert(hostname.clone());
            }

            let port = next_port.ok_or(InventoryError::PortsExhausted {
                base: self.inventory.base_port,
            })?;
            match self.host_record(&key, device, port) {
                Ok(record) => {
                    debug!(device = %key, hostname = %hostname, port, "Provisioned host");
                    out.hosts.insert(hostname, record);
                    next_port = port.checked_add(1);
                }
                Err(e) if e.is_per_device() => {
                    warn!(device = %key, error = %e, "Skipping device");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            hosts = out.hosts.len(),
            groups = out.groups.len(),
            devices = devices.len(),
            "Provisioned inventory"
        );
        Ok(out)
    }

    /// Build the host record of a single device with target port `port`.
    ///
    /// # Errors
    ///
    /// Returns `MissingCredentialFields` if the username or password is
    /// absent or undecodable, or an error if the key cannot be cached.
    pub fn host_record(&self, key: &DeviceKey, device: &Device, port: u16) -> Result<HostRecord> {
        let secrets = device.secrets();
        let user = required(key, "username", secrets.username.as_deref())?;
        let password = required(key, "userpassword", secrets.userpassword.as_deref())?;

        let key_file = match secrets.rsa_private.as_deref().map(decode_secret) {
            Some(Ok(pem)) => self.cache.ensure_key(key, &pem)?.0,
            Some(Err(e)) => {
                warn!(device = %key, error = %e, "Private key is not decodable, not caching it");
                self.cache.key_path(key)
            }
            None => {
                warn!(device = %key, "Device has no private key");
                self.cache.key_path(key)
            }
        };

        let tunnel = self.tunnels.descriptor_for(device);

        Ok(HostRecord {
            ansible_connection: self.inventory.connection_kind.clone(),
            ansible_port: port,
            ansible_host: "localhost".to_string(),
            ansible_user: user,
            ansible_sudo_pass: password.clone(),
            ansible_become: "yes".to_string(),
            ansible_become_user: self.inventory.become_user.clone(),
            ansible_become_pass: password,
            ansible_ssh_private_key_file: key_file,
            ansible_python_interpreter: self.inventory.python_interpreter.clone(),
            ansible_ssh_retries: self.retries,
            ansible_kubectl_namespace: key.namespace().to_string(),
            ansible_kubectl_context: self.context.clone(),
            ansible_deadend_tunnel_port: tunnel.port,
            ansible_deadend_tunnel_open: tunnel.open,
            ansible_deadend_device: key.name().to_string(),
        })
    }
}

fn required(key: &DeviceKey, field: &'static str, value: Option<&str>) -> Result<String> {
    let missing = || InventoryError::MissingCredentialFields {
        device: key.clone(),
        field,
    };
    let decoded = decode_secret(value.ok_or_else(missing)?).map_err(|_| missing())?;
    if decoded.is_empty() {
        return Err(missing());
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadend_core::encode_secret;
    use deadend_core::tunnel::encode_port;
    use deadend_registry::{MockRegistry, SecretBundle};
    use std::fs;

    fn device(namespace: &str, name: &str, password: Option<&str>, tunnel: Option<&str>) -> Device {
        Device::with_identity(
            namespace,
            name,
            BTreeMap::from([("site".to_string(), "north-1".to_string())]),
            SecretBundle {
                rsa_private: Some(encode_secret(&format!("key of {name}"))),
                username: Some(encode_secret("pi")),
                userpassword: password.map(encode_secret),
                tunnel: tunnel.map(ToString::to_string),
            },
        )
    }

    fn provisioner(cache: &std::path::Path) -> CredentialProvisioner<MockRegistry> {
        let mut config = DeadendConfig::default();
        config.inventory.cache_dir = cache.to_path_buf();
        config.registry.context = Some("prod".to_string());
        let tunnels = Arc::new(TunnelStore::with_seed(Arc::new(MockRegistry::new()), 1));
        CredentialProvisioner::new(tunnels, &config)
    }

    #[test]
    fn host_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let dev = device("fleet-a", "cam-01", Some("hunter2"), Some(&encode_port(40001)));
        let key = dev.key().unwrap();

        let record = p.host_record(&key, &dev, 2200).unwrap();

        assert_eq!(record.ansible_connection, "deadend");
        assert_eq!(record.ansible_host, "localhost");
        assert_eq!(record.ansible_user, "pi");
        assert_eq!(record.ansible_sudo_pass, "hunter2");
        assert_eq!(record.ansible_become_pass, "hunter2");
        assert_eq!(record.ansible_become_user, "root");
        assert_eq!(record.ansible_ssh_retries, 20);
        assert_eq!(record.ansible_kubectl_namespace, "fleet-a");
        assert_eq!(record.ansible_kubectl_context.as_deref(), Some("prod"));
        assert_eq!(record.ansible_deadend_tunnel_port, Some(40001));
        assert!(record.ansible_deadend_tunnel_open);
        assert_eq!(record.device_key().unwrap(), key);
        assert_eq!(
            fs::read_to_string(&record.ansible_ssh_private_key_file).unwrap(),
            "key of cam-01"
        );
    }

    #[test]
    fn undecodable_password_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let mut dev = device("fleet-a", "cam-01", None, None);
        dev.spec.keys.data.userpassword = Some("%%% not base64".to_string());
        let key = dev.key().unwrap();

        let err = p.host_record(&key, &dev, 2200).unwrap_err();
        assert!(matches!(
            err,
            InventoryError::MissingCredentialFields {
                field: "userpassword",
                ..
            }
        ));
        assert!(!p.cache().key_path(&key).exists());
    }

    #[test]
    fn ports_follow_sorted_emitted_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let devices = vec![
            device("fleet-b", "a", Some("pw"), None),
            device("fleet-a", "z", Some("pw"), None),
            device("fleet-a", "m", None, None),
            device("fleet-a", "b", Some("pw"), None),
        ];

        let out = p.provision(&devices).unwrap();

        let ports: Vec<(&str, u16)> = out
            .hosts
            .iter()
            .map(|(h, r)| (h.as_str(), r.ansible_port))
            .collect();
        assert_eq!(
            ports,
            vec![("fleet_a-b", 2200), ("fleet_a-z", 2201), ("fleet_b-a", 2202)]
        );
        assert_eq!(out.groups["fleet_a"].len(), 3);
        assert!(out.groups["fleet_a"].contains("fleet_a-m"));
        assert_eq!(out.groups["site_north_1"].len(), 4);
    }

    #[test]
    fn colliding_hostnames_keep_the_first_device() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let devices = vec![
            device("fleet.a", "cam-01", Some("second"), None),
            device("fleet-a", "cam-01", Some("first"), None),
            device("fleet-a", "cam-02", Some("pw"), None),
        ];

        let out = p.provision(&devices).unwrap();

        assert_eq!(out.hosts.len(), 2);
        let kept = &out.hosts["fleet_a-cam-01"];
        assert_eq!(kept.ansible_kubectl_namespace, "fleet-a");
        assert_eq!(kept.ansible_sudo_pass, "first");
        assert_eq!(out.hosts["fleet_a-cam-02"].ansible_port, 2201);
        assert!(!p.cache().key_path(&devices[0].key().unwrap()).exists());
    }

    #[test]
    fn closed_tunnel_gets_a_port_hint() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let dev = device("fleet-a", "cam-01", Some("pw"), Some(&encode_secret("NA")));
        let key = dev.key().unwrap();

        let record = p.host_record(&key, &dev, 2200).unwrap();
        assert!(!record.ansible_deadend_tunnel_open);
        assert!(record.ansible_deadend_tunnel_port.is_some_and(|p| p >= 1024));
    }
}
