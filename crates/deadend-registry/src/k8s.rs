//! Kubernetes-backed device registry.
//!
//! This module provides the [`DeviceRegistry`] trait and [`KubeRegistry`], which
//! reads `Device` records and merge-patches their tunnel field through the
//! Kubernetes API.

use async_trait::async_trait;
use deadend_core::{DeviceKey, RegistryConfig};
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Resource};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::{RegistryError, Result};

/// Read/patch access to device records.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// List every device in scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Fetch a single device.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record does not exist, or an error if the
    /// store cannot be reached.
    async fn get_device(&self, key: &DeviceKey) -> Result<Device>;

    /// Overwrite the encoded tunnel field of a device.
    ///
    /// # Errors
    ///
    /// Returns `TunnelRequestFailed` if the update is rejected, or an error if
    /// the store cannot be reached.
    async fn patch_tunnel(&self, key: &DeviceKey, encoded: &str) -> Result<()>;
}

/// Device registry served by the Kubernetes API.
pub struct KubeRegistry {
    client: Client,
    namespace: Option<String>,
}

impl KubeRegistry {
    /// Connect using the kubeconfig context from `config`, or the default
    /// client configuration when no context is set.
    ///
    /// # Errors
    ///
    /// Returns an error if no client configuration can be loaded.
    pub async fn new(config: &RegistryConfig) -> Result<Self> {
        let client = match &config.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                let kube_config = kube::Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| RegistryError::Kubeconfig(e.to_string()))?;
                Client::try_from(kube_config)?
            }
            None => Client::try_default().await?,
        };

        info!(
            context = ?config.context,
            namespace = ?config.namespace,
            "Connected to device registry"
        );

        Ok(Self::with_client(client, config))
    }

    /// Create a registry with a pre-configured client.
    #[must_use]
    pub fn with_client(client: Client, config: &RegistryConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
        }
    }

    // Records are fetched untyped and parsed one by one, so a single
    // malformed device cannot fail a listing.
    fn listing_api(&self) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<Device>(&());
        match &self.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn device_api(&self, key: &DeviceKey) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<Device>(&());
        Api::namespaced_with(self.client.clone(), key.namespace(), &resource)
    }
}

/// Parse an untyped record into a [`Device`].
///
/// A missing `spec` reads as empty.
///
/// # Errors
///
/// Returns `InvalidRecord` if the record does not have the device shape.
pub fn parse_device(object: DynamicObject) -> Result<Device> {
    let label = format!(
        "{}/{}",
        object.metadata.namespace.as_deref().unwrap_or("?"),
        object.metadata.name.as_deref().unwrap_or("?")
    );
    let invalid = |e: serde_json::Error| RegistryError::InvalidRecord(format!("{label}: {e}"));

    let mut value = serde_json::to_value(object).map_err(invalid)?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("apiVersion")
            .or_insert_with(|| Device::api_version(&()).into());
        fields
            .entry("kind")
            .or_insert_with(|| Device::kind(&()).into());
        if fields.get("spec").map_or(true, serde_json::Value::is_null) {
            fields.insert("spec".to_string(), serde_json::json!({}));
        }
    }
    serde_json::from_value(value).map_err(invalid)
}

#[async_trait]
impl DeviceRegistry for KubeRegistry {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let list = self.listing_api().list(&ListParams::default()).await?;
        let total = list.items.len();

        let devices: Vec<Device> = list
            .items
            .into_iter()
            .filter_map(|object| match parse_device(object) {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable device record");
                    None
                }
            })
            .collect();

        debug!(count = devices.len(), skipped = total - devices.len(), "Listed devices");
        Ok(devices)
    }

    async fn get_device(&self, key: &DeviceKey) -> Result<Device> {
        let object = self
            .device_api(key)
            .get_opt(key.name())
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        parse_device(object)
    }

    async fn patch_tunnel(&self, key: &DeviceKey, encoded: &str) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "keys": {
                    "data": {
                        "tunnel": encoded
                    }
                }
            }
        });

        match self
            .device_api(key)
            .patch(key.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                debug!(device = %key, "Patched tunnel field");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(RegistryError::NotFound(key.clone())),
            Err(kube::Error::Api(e)) => {
                warn!(device = %key, code = e.code, message = %e.message, "Tunnel update rejected");
                Err(RegistryError::TunnelRequestFailed {
                    device: key.clone(),
                    reason: e.message,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// An in-memory registry for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// A registry that keeps device records in memory and records patches.
    #[derive(Default)]
    pub struct MockRegistry {
        devices: Mutex<BTreeMap<DeviceKey, Device>>,
        patches: Mutex<Vec<(DeviceKey, String)>>,
        reject_patches: Mutex<bool>,
        unavailable: Mutex<bool>,
    }

    impl MockRegistry {
        /// Create an empty registry.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a registry holding `devices`.
        ///
        /// # Panics
        ///
        /// Panics if a device has no name or namespace.
        #[must_use]
        pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
            let registry = Self::new();
            for device in devices {
                registry.insert(device);
            }
            registry
        }

        /// Insert or replace a device.
        ///
        /// # Panics
        ///
        /// Panics if the device has no name or namespace.
        pub fn insert(&self, device: Device) {
            let key = device.key().expect("mock devices need an identity");
            self.devices.lock().insert(key, device);
        }

        /// Make every subsequent tunnel update fail as rejected.
        pub fn reject_patches(&self, reject: bool) {
            *self.reject_patches.lock() = reject;
        }

        /// Make every subsequent call fail as if the store were unreachable.
        pub fn set_unavailable(&self, unavailable: bool) {
            *self.unavailable.lock() = unavailable;
        }

        /// Tunnel updates received so far, in order.
        #[must_use]
        pub fn patches(&self) -> Vec<(DeviceKey, String)> {
            self.patches.lock().clone()
        }

        /// Current record of a device.
        #[must_use]
        pub fn device(&self, key: &DeviceKey) -> Option<Device> {
            self.devices.lock().get(key).cloned()
        }

        fn check_available(&self) -> Result<()> {
            if *self.unavailable.lock() {
                return Err(RegistryError::Kubeconfig(
                    "mock registry is unavailable".to_string(),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceRegistry for MockRegistry {
        async fn list_devices(&self) -> Result<Vec<Device>> {
            self.check_available()?;
            Ok(self.devices.lock().values().cloned().collect())
        }

        async fn get_device(&self, key: &DeviceKey) -> Result<Device> {
            self.check_available()?;
            self.device(key)
                .ok_or_else(|| RegistryError::NotFound(key.clone()))
        }

        async fn patch_tunnel(&self, key: &DeviceKey, encoded: &str) -> Result<()> {
            self.check_available()?;
            if *self.reject_patches.lock() {
                return Err(RegistryError::TunnelRequestFailed {
                    device: key.clone(),
                    reason: "rejected by mock".to_string(),
                });
            }

            let mut devices = self.devices.lock();
            let device = devices
                .get_mut(key)
                .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
            device.spec.keys.data.tunnel = Some(encoded.to_string());
            self.patches.lock().push((key.clone(), encoded.to_string()));
            Ok(())
        }
    }
}
