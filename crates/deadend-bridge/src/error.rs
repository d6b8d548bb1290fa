//! Error types for the bridge supervisor.
//!
//! Every variant means the local path to the broker is missing, so callers
//! treat all of them as fatal for the whole run.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while starting the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The forwarder could not be spawned at all.
    #[error("failed to spawn bridge process {program}: {source}")]
    Spawn {
        /// The executable that was launched.
        program: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The forwarder exited during warm-up.
    #[error("bridge process exited during warm-up ({status}), is the local port already in use? {stderr}")]
    EarlyExit {
        /// Exit status of the forwarder.
        status: String,
        /// Whatever the forwarder wrote to stderr.
        stderr: String,
    },

    /// The forwarder's first line was not the readiness marker.
    #[error("bridge process did not report readiness, first line was {line:?}")]
    NotReady {
        /// The line that was read instead, empty on end of output.
        line: String,
    },

    /// The forwarder printed nothing within the readiness timeout.
    #[error("bridge process printed nothing within {0:?}")]
    ReadinessTimeout(Duration),

    /// A previous start in this run failed and no `stop()` followed.
    #[error("bridge failed to start earlier in this run")]
    PreviouslyFailed,

    /// Reading the forwarder's output failed.
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
