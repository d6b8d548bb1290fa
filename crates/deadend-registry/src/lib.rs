//! Device registry and tunnel state client for deadend.
//!
//! Devices live as `devices.kubeflow.org` custom resources. This crate reads
//! them and records tunnel intent on them:
//!
//! - [`DeviceRegistry`]: list/get/patch seam, implemented by [`KubeRegistry`]
//! - [`TunnelStore`]: tunnel `read`, `open` and `close` on top of a registry
//! - [`Device`]: the typed custom resource
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deadend_core::{DeviceKey, RegistryConfig};
//! use deadend_registry::{KubeRegistry, TunnelStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(KubeRegistry::new(&RegistryConfig::default()).await?);
//! let tunnels = TunnelStore::new(registry);
//!
//! let key: DeviceKey = "fleet-a/cam-01".parse()?;
//! let desc = tunnels.read(&key).await?;
//! if !desc.open {
//!     if let Some(port) = desc.port {
//!         tunnels.open(&key, port).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockRegistry`], an in-memory registry
//! that records every tunnel update.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod device;
pub mod error;
pub mod k8s;
pub mod tunnel;

pub use device::{Device, DeviceKeys, DeviceSpec, DeviceStatus, SecretBundle};
pub use error::{RegistryError, Result};
pub use k8s::{DeviceRegistry, KubeRegistry};
pub use tunnel::TunnelStore;

#[cfg(any(test, feature = "test-utils"))]
pub use k8s::mock::MockRegistry;
