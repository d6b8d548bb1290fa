//! Transports that reach a device through its reverse tunnel.
//!
//! A device's tunnel terminates on the broker, which the operator reaches
//! through the local bridge. [`SshTransport`] wraps the system `ssh` binary
//! and hops through the bridge with a `ProxyCommand`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use deadend_core::ConnectionConfig;
use tokio::process::Command;
use tracing::debug;

use crate::TransportError;

/// Where and as whom to log in on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host the broker exposes tunnels on.
    pub host: String,
    /// Tunnel port of the device.
    pub port: u16,
    /// Login user on the device.
    pub user: String,
    /// Private key file for the login.
    pub key_file: PathBuf,
}

/// Result of running one command on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `-1` when the command was killed by a signal.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }
}

/// A connection to a single device.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached.
    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError>;

    /// Run a command on the connected device.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the command cannot be launched.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError>;

    /// Release the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be shut down cleanly.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Transport that runs the system `ssh` client through the local bridge.
pub struct SshTransport {
    executable: String,
    extra_args: Vec<String>,
    connect_timeout_secs: u64,
    host_key_checking: bool,
    bridge_port: u16,
    target: Option<ConnectTarget>,
}

impl SshTransport {
    /// Create a transport from connection settings and the bridge's local port.
    #[must_use]
    pub fn new(config: &ConnectionConfig, bridge_port: u16) -> Self {
        Self {
            executable: config.ssh_executable.clone(),
            extra_args: config.ssh_args.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            host_key_checking: config.host_key_checking,
            bridge_port,
            target: None,
        }
    }

    /// Arguments for one `ssh` invocation against `target` running `command`.
    #[must_use]
    pub fn command_args(&self, target: &ConnectTarget, command: &str) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "-o".to_string(),
            format!(
                "ProxyCommand=nc -X connect -x 127.0.0.1:{} %h %p",
                self.bridge_port
            ),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]);
        if !self.host_key_checking {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }
        args.extend([
            "-p".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.key_file.display().to_string(),
            format!("{}@{}", target.user, target.host),
            command.to_string(),
        ]);
        args
    }

    async fn run(&self, target: &ConnectTarget, command: &str) -> Result<ExecOutput, TransportError> {
        let args = self.command_args(target, command);
        debug!(program = %self.executable, port = target.port, command, "Running ssh");

        let output = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| TransportError::Launch {
                program: self.executable.clone(),
                source,
            })?;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError> {
        let check = self.run(target, "true").await?;
        if !check.success() {
            return Err(TransportError::ConnectFailed(format!(
                "ssh exited with {}: {}",
                check.status,
                check.stderr.trim()
            )));
        }
        self.target = Some(target.clone());
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let target = self.target.as_ref().ok_or(TransportError::NotConnected)?;
        self.run(target, command).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.target = None;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! Scripted transport for tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Calls observed by a [`MockTransport`].
    #[derive(Debug, Default)]
    pub struct MockLog {
        /// Targets passed to `connect`, one per attempt.
        pub connects: Vec<ConnectTarget>,
        /// Commands passed to `exec`.
        pub execs: Vec<String>,
        /// Number of `close` calls.
        pub closes: u32,
    }

    /// A transport that fails a scripted number of connects and then succeeds.
    pub struct MockTransport {
        outcomes: VecDeque<bool>,
        log: Arc<Mutex<MockLog>>,
        connected: bool,
        launch_fails: bool,
    }

    impl MockTransport {
        /// Fail the first `failures` connects, succeed afterwards.
        #[must_use]
        pub fn failing(failures: usize) -> Self {
            Self {
                outcomes: std::iter::repeat(false).take(failures).collect(),
                log: Arc::default(),
                connected: false,
                launch_fails: false,
            }
        }

        /// Fail every connect as if the client binary were missing.
        #[must_use]
        pub fn missing_binary() -> Self {
            Self {
                launch_fails: true,
                ..Self::failing(0)
            }
        }

        /// Succeed on the first connect.
        #[must_use]
        pub fn reachable() -> Self {
            Self::failing(0)
        }

        /// Shared handle to the call log.
        #[must_use]
        pub fn log(&self) -> Arc<Mutex<MockLog>> {
            Arc::clone(&self.log)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError> {
            self.log.lock().connects.push(target.clone());
            if self.launch_fails {
                return Err(TransportError::Launch {
                    program: "ssh".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            if self.outcomes.pop_front().unwrap_or(true) {
                self.connected = true;
                Ok(())
            } else {
                Err(TransportError::ConnectFailed("connection refused".to_string()))
            }
        }

        async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.log.lock().execs.push(command.to_string());
            Ok(ExecOutput {
                status: 0,
                stdout: format!("{command}\n"),
                stderr: String::new(),
            })
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.connected = false;
            self.log.lock().closes += 1;
            Ok(())
        }
    }
}
