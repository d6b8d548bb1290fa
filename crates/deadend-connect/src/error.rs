//! Error types for the connect crate.

use deadend_bridge::BridgeError;
use deadend_core::DeviceKey;
use deadend_registry::RegistryError;
use thiserror::Error;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport binary could not be launched.
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// The executable that was launched.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The device did not accept the connection.
    #[error("connection refused: {0}")]
    ConnectFailed(String),

    /// The operation needs a connected transport.
    #[error("transport is not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether another connect attempt may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::ConnectFailed(_))
    }
}

/// Errors raised while bootstrapping a device connection.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The local bridge could not be brought up.
    #[error("bridge unavailable: {0}")]
    Bridge(#[from] BridgeError),

    /// Reading or requesting the tunnel failed.
    #[error("tunnel state error: {0}")]
    Registry(#[from] RegistryError),

    /// The device record yields no port to connect to.
    #[error("no tunnel port recorded for {0}")]
    NoTunnelPort(DeviceKey),

    /// Every connect attempt failed.
    #[error("gave up after {attempts} connect attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: TransportError,
    },

    /// A transport operation failed after the connection was established.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection was closed and cannot be reused.
    #[error("connection to {0} is closed")]
    Closed(DeviceKey),
}

impl ConnectError {
    /// Whether the failure should abort the whole run rather than one device.
    #[must_use]
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(self, Self::Bridge(_))
    }

    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_retriable(),
            Self::RetryExhausted { .. } => true,
            _ => false,
        }
    }
}

/// A specialized Result type for connect operations.
pub type Result<T> = std::result::Result<T, ConnectError>;
