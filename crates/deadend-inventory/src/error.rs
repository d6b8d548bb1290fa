//! Error types for inventory generation.

use std::path::PathBuf;

use deadend_core::DeviceKey;
use deadend_registry::RegistryError;
use thiserror::Error;

/// Errors that can occur while provisioning credentials or building the inventory.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// A device lacks a secret field every host record needs.
    #[error("device {device} is missing credential field {field}")]
    MissingCredentialFields {
        /// The device that was skipped.
        device: DeviceKey,
        /// The absent or undecodable field.
        field: &'static str,
    },

    /// The credential cache could not be written.
    #[error("credential file {}: {source}", path.display())]
    CredentialFile {
        /// The file being created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// More hosts than target ports above the base port.
    #[error("ran out of target ports above {base}")]
    PortsExhausted {
        /// The configured base port.
        base: u16,
    },

    /// Listing devices failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The inventory could not be rendered.
    #[error("failed to render inventory: {0}")]
    Render(#[from] serde_json::Error),
}

impl InventoryError {
    /// Whether the error only affects a single device.
    #[must_use]
    pub const fn is_per_device(&self) -> bool {
        matches!(self, Self::MissingCredentialFields { .. })
    }
}

/// A specialized Result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
