//! Connection bootstrap.
//!
//! [`BootstrapConnection`] wraps a [`Transport`] and makes sure the local
//! bridge runs and the device has been asked for a tunnel before the transport
//! connects:
//!
//! ```text
//!   Disconnected ─▶ TunnelCheck ─┬─▶ TunnelOpen ──────┬─▶ Connecting ─▶ Connected
//!                                └─▶ TunnelRequested ─┘
//!   close() from anywhere ─▶ Closed
//! ```
//!
//! The device picks up a requested tunnel on its own schedule, so connect
//! attempts are retried with a fixed delay. Tunnel requests are never retried
//! and never withdrawn by this type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deadend_bridge::Bridge;
use deadend_core::{ConnectionConfig, DeviceKey};
use deadend_registry::{DeviceRegistry, TunnelStore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::transport::{ConnectTarget, ExecOutput, Transport};
use crate::{ConnectError, Result};

/// Connection state of a [`BootstrapConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or the last connect failed.
    Disconnected,
    /// Reading the device's tunnel state.
    TunnelCheck,
    /// The device already has an open tunnel.
    TunnelOpen,
    /// A tunnel was requested on this connect.
    TunnelRequested,
    /// Attempting transport connects.
    Connecting,
    /// The transport is connected.
    Connected,
    /// Closed; the connection cannot be reused.
    Closed,
}

/// Bounded retry with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connect attempts.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy from connection settings.
    #[must_use]
    pub const fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            attempts: config.retries,
            delay: config.retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// Login material for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// Login user.
    pub user: String,
    /// Private key file.
    pub key_file: PathBuf,
}

/// A device connection that ensures its tunnel before connecting.
pub struct BootstrapConnection<T, B: ?Sized, R: ?Sized> {
    device: DeviceKey,
    login: Login,
    broker_host: String,
    transport: T,
    bridge: Arc<B>,
    tunnels: Arc<TunnelStore<R>>,
    policy: RetryPolicy,
    state: ConnectionState,
    tunnel_requested: bool,
    tunnel_port: Option<u16>,
}

impl<T, B, R> BootstrapConnection<T, B, R>
where
    T: Transport,
    B: Bridge + ?Sized,
    R: DeviceRegistry + ?Sized,
{
    /// Create a disconnected connection to `device`.
    #[must_use]
    pub fn new(
        device: DeviceKey,
        login: Login,
        transport: T,
        bridge: Arc<B>,
        tunnels: Arc<TunnelStore<R>>,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            device,
            login,
            broker_host: config.broker_host.clone(),
            transport,
            bridge,
            tunnels,
            policy: RetryPolicy::from_config(config),
            state: ConnectionState::Disconnected,
            tunnel_requested: false,
            tunnel_port: None,
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The device this connection targets.
    #[must_use]
    pub const fn device(&self) -> &DeviceKey {
        &self.device
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a tunnel open was issued by this connection.
    #[must_use]
    pub const fn tunnel_requested(&self) -> bool {
        self.tunnel_requested
    }

    /// The tunnel port used by the last connect.
    #[must_use]
    pub const fn tunnel_port(&self) -> Option<u16> {
        self.tunnel_port
    }

    /// Bring up the bridge, ensure a tunnel and connect the transport.
    ///
    /// A connected connection is left as is.
    ///
    /// # Errors
    ///
    /// - `Bridge` if the bridge cannot be started
    /// - `Registry` if the tunnel cannot be read or requested
    /// - `RetryExhausted` if every transport connect fails
    /// - `Closed` if the connection was closed
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(ConnectError::Closed(self.device.clone())),
            _ => {}
        }

        let result = self.establish().await;
        if result.is_err() {
            self.state = ConnectionState::Disconnected;
        }
        result
    }

    async fn establish(&mut self) -> Result<()> {
        self.bridge.ensure_running().await?;

        self.state = ConnectionState::TunnelCheck;
        let desc = self.tunnels.read(&self.device).await?;
        let port = desc
            .port
            .ok_or_else(|| ConnectError::NoTunnelPort(self.device.clone()))?;

        if desc.open {
            debug!(device = %self.device, port, "Tunnel already open");
            self.state = ConnectionState::TunnelOpen;
        } else {
            info!(device = %self.device, port, "Requesting reverse tunnel");
            self.tunnels.open(&self.device, port).await?;
            self.tunnel_requested = true;
            self.state = ConnectionState::TunnelRequested;
        }
        self.tunnel_port = Some(port);

        let target = ConnectTarget {
            host: self.broker_host.clone(),
            port,
            user: self.login.user.clone(),
            key_file: self.login.key_file.clone(),
        };

        self.state = ConnectionState::Connecting;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.connect(&target).await {
                Ok(()) => {
                    info!(device = %self.device, port, attempt, "Connected");
                    self.state = ConnectionState::Connected;
                    return Ok(());
                }
                Err(e) if !e.is_retriable() => {
                    warn!(device = %self.device, attempt, error = %e, "Transport unusable");
                    return Err(e.into());
                }
                Err(e) if attempt >= self.policy.attempts => {
                    warn!(device = %self.device, attempts = attempt, error = %e, "Giving up");
                    return Err(ConnectError::RetryExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    debug!(
                        device = %self.device,
                        attempt,
                        max_attempts = self.policy.attempts,
                        error = %e,
                        "Connect attempt failed, retrying"
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }
    }

    /// Run a command on the device.
    ///
    /// # Errors
    ///
    /// Returns `Transport(NotConnected)` before a successful connect, or the
    /// transport's own error.
    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        match self.state {
            ConnectionState::Connected => Ok(self.transport.exec(command).await?),
            ConnectionState::Closed => Err(ConnectError::Closed(self.device.clone())),
            _ => Err(crate::TransportError::NotConnected.into()),
        }
    }

    /// Close the transport. The device's tunnel stays as recorded.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if it fails to shut down.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.transport.close().await?;
        debug!(device = %self.device, "Connection closed");
        Ok(())
    }
}
