//! Credential provisioning and Ansible dynamic inventory for deadend.
//!
//! - [`CredentialProvisioner`]: device listing to host records, caching keys
//!   in a [`CredentialCache`]
//! - [`assemble`]: host records and groups to an [`Inventory`] document
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deadend_core::DeadendConfig;
//! use deadend_inventory::{assemble, CredentialProvisioner};
//! use deadend_registry::{KubeRegistry, TunnelStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeadendConfig::from_env()?;
//! let registry = Arc::new(KubeRegistry::new(&config.registry).await?);
//! let provisioner = CredentialProvisioner::new(Arc::new(TunnelStore::new(registry)), &config);
//!
//! let inventory = assemble(provisioner.provision_all().await?);
//! println!("{}", inventory.to_json()?);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credentials;
pub mod document;
pub mod error;
pub mod provision;

pub use credentials::{CredentialCache, KEY_FILE_MODE};
pub use document::{assemble, empty_inventory, Group, Inventory, Meta};
pub use error::{InventoryError, Result};
pub use provision::{CredentialProvisioner, HostRecord, Provisioned};
