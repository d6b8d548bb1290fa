//! Error types for the registry crate.

use deadend_core::DeviceKey;
use thiserror::Error;

/// Errors that can occur while reading or updating device records.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The API server could not be reached or answered unexpectedly.
    #[error("device registry unavailable: {0}")]
    Unavailable(#[from] kube::Error),

    /// No usable kubeconfig could be loaded.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The device record does not exist.
    #[error("device not found: {0}")]
    NotFound(DeviceKey),

    /// The API server rejected a tunnel update.
    #[error("tunnel request for {device} rejected: {reason}")]
    TunnelRequestFailed {
        /// The device whose record was being patched.
        device: DeviceKey,
        /// The rejection reported by the server.
        reason: String,
    },

    /// A record lacks the identity fields every device must have.
    #[error("malformed device record: {0}")]
    InvalidRecord(String),
}

impl RegistryError {
    /// Whether the store itself is unreachable or misconfigured.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Kubeconfig(_))
    }

    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A specialized Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
