//! Per-device connections over deadend reverse tunnels.
//!
//! - [`BootstrapConnection`]: ensures bridge and tunnel, then connects with retries
//! - [`Transport`]: the seam a connection delegates to
//! - [`SshTransport`]: the system `ssh` client, hopping through the bridge
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deadend_bridge::BridgeSupervisor;
//! use deadend_connect::{BootstrapConnection, Login, SshTransport};
//! use deadend_core::DeadendConfig;
//! use deadend_registry::{KubeRegistry, TunnelStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeadendConfig::from_env()?;
//! let bridge = Arc::new(BridgeSupervisor::new(&config.bridge));
//! let tunnels = Arc::new(TunnelStore::new(Arc::new(
//!     KubeRegistry::new(&config.registry).await?,
//! )));
//!
//! let mut conn = BootstrapConnection::new(
//!     "fleet-a/cam-01".parse()?,
//!     Login { user: "pi".into(), key_file: "inv/fleet-a/cam-01.pem".into() },
//!     SshTransport::new(&config.connection, config.bridge.local_port),
//!     bridge,
//!     tunnels,
//!     &config.connection,
//! );
//! conn.connect().await?;
//! let out = conn.exec("uptime").await?;
//! print!("{}", out.stdout);
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bootstrap;
pub mod error;
pub mod transport;

pub use bootstrap::{BootstrapConnection, ConnectionState, Login, RetryPolicy};
pub use error::{ConnectError, Result, TransportError};
pub use transport::{ConnectTarget, ExecOutput, SshTransport, Transport};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::mock::{MockLog, MockTransport};
