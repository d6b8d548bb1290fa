//! The `Device` custom resource.
//!
//! Devices are served by the API server as `devices.kubeflow.org`. Only the
//! fields deadend reads or writes are modelled; everything else on the record
//! is ignored on read and left untouched by merge patches.

use std::collections::BTreeMap;

use deadend_core::tunnel::{self, TunnelStatus};
use deadend_core::{DeviceKey, TunnelDescriptor};
use kube::api::ObjectMeta;
use kube::CustomResource;
use rand::Rng;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{RegistryError, Result};

/// Desired state of a device.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "Device",
    plural = "devices",
    namespaced,
    status = "DeviceStatus",
    schema = "disabled"
)]
pub struct DeviceSpec {
    /// Credential material for the device.
    #[serde(default)]
    pub keys: DeviceKeys,
}

/// Wrapper around the secret bundle, mirroring the record layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The secret bundle.
    #[serde(default)]
    pub data: SecretBundle,
}

/// Base64-encoded secrets of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretBundle {
    /// PEM private key used to log in.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_text"
    )]
    pub rsa_private: Option<String>,
    /// Login user.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_text"
    )]
    pub username: Option<String>,
    /// Login and sudo password.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_text"
    )]
    pub userpassword: Option<String>,
    /// Requested tunnel port, or the closed sentinel.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_text"
    )]
    pub tunnel: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawText {
    Text(String),
    Other(IgnoredAny),
}

/// Non-string secret values are treated as absent.
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<RawText>::deserialize(deserializer)? {
        Some(RawText::Text(text)) => Some(text),
        Some(RawText::Other(_)) | None => None,
    })
}

/// Observed state reported by the device side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Tunnel state as seen by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelStatus>,
}

impl Device {
    /// Build a device record with identity, labels and secrets.
    #[must_use]
    pub fn with_identity(
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        secrets: SecretBundle,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            },
            spec: DeviceSpec {
                keys: DeviceKeys { data: secrets },
            },
            status: None,
        }
    }

    /// The `namespace/name` identity of this record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record has no name or no namespace.
    pub fn key(&self) -> Result<DeviceKey> {
        let name = self
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| RegistryError::InvalidRecord("device without a name".to_string()))?;
        let namespace = self.metadata.namespace.as_deref().ok_or_else(|| {
            RegistryError::InvalidRecord(format!("device {name} without a namespace"))
        })?;
        DeviceKey::new(namespace, name).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
    }

    /// Labels of the record, empty when none are set.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// The secret bundle.
    #[must_use]
    pub fn secrets(&self) -> &SecretBundle {
        &self.spec.keys.data
    }

    /// The tunnel sub-record of the status, if the device reported one.
    #[must_use]
    pub fn tunnel_status(&self) -> Option<&TunnelStatus> {
        self.status.as_ref().and_then(|s| s.tunnel.as_ref())
    }

    /// The tunnel descriptor exactly as recorded.
    #[must_use]
    pub fn recorded_tunnel(&self) -> TunnelDescriptor {
        tunnel::recorded(self.tunnel_status(), self.secrets().tunnel.as_deref())
    }

    /// The tunnel descriptor, with a fresh port when none is usable.
    pub fn resolve_tunnel<R: Rng + ?Sized>(&self, rng: &mut R) -> TunnelDescriptor {
        tunnel::resolve(self.tunnel_status(), self.secrets().tunnel.as_deref(), rng)
    }
}
