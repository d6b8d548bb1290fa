//! Core types and utilities for deadend.
//!
//! This crate provides the foundational pieces shared by every deadend crate:
//!
//! - **Identifiers**: [`DeviceKey`], the `namespace/name` identity of a device
//! - **Tunnel descriptors**: decoding and resolution of a device's tunnel state
//! - **Group naming**: the normalization that turns namespaces and labels into
//!   inventory groups
//! - **Configuration**: the validated [`DeadendConfig`] passed to every component
//!
//! # Example
//!
//! ```
//! use deadend_core::{hostname_for, DeviceKey, TunnelDescriptor};
//! use deadend_core::tunnel::{encode_port, resolve};
//!
//! let key: DeviceKey = "fleet-a/cam-01".parse().unwrap();
//! assert_eq!(hostname_for(&key), "fleet_a-cam-01");
//!
//! let mut rng = rand::thread_rng();
//! let desc = resolve(None, Some(&encode_port(40001)), &mut rng);
//! assert_eq!(desc, TunnelDescriptor::open(40001));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod group;
pub mod ids;
pub mod secret;
pub mod tunnel;

pub use config::{BridgeConfig, ConnectionConfig, DeadendConfig, InventoryConfig, RegistryConfig};
pub use error::{ConfigError, Result};
pub use group::{hostname_for, label_group, namespace_group, normalize_group};
pub use ids::{DeviceKey, IdError};
pub use secret::{decode_secret, encode_secret, SecretError};
pub use tunnel::{TunnelDescriptor, TunnelStatus};
