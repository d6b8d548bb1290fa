//! Local bridge to the deadend tunnel broker.
//!
//! Devices dial out to a broker running inside the cluster. The operator
//! reaches it through a single `kubectl port-forward` process per run, owned
//! by a [`BridgeSupervisor`]:
//!
//! - `start()` is idempotent and serialized, so one process is ever spawned
//! - readiness is a bounded read of the forwarder's first line
//! - `stop()` and `Drop` terminate the forwarder's whole process group
//!
//! # Example
//!
//! ```no_run
//! use deadend_bridge::BridgeSupervisor;
//! use deadend_core::BridgeConfig;
//!
//! # async fn example() -> Result<(), deadend_bridge::BridgeError> {
//! let bridge = BridgeSupervisor::new(&BridgeConfig::default());
//! bridge.start().await?;
//! // ... connect to devices through 127.0.0.1:8118 ...
//! bridge.stop().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod supervisor;

pub use error::{BridgeError, Result};
pub use supervisor::{Bridge, BridgeCommand, BridgeState, BridgeSupervisor};
