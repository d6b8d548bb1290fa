//! The bridge supervisor.
//!
//! ```text
//!   NotStarted ──start()──▶ Starting ──ready──▶ Running
//!       ▲                      │
//!       │                      └──exit / wrong line / timeout──▶ Failed
//!       │                                                          │
//!       └─────────────────────────── stop() ◀──────────────────────┘
//! ```
//!
//! The forwarder runs in its own process group so that `stop()` also reaches
//! whatever it spawned. Dropping the supervisor terminates the group too.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadend_core::BridgeConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::{BridgeError, Result};

/// Grace period between SIGTERM and SIGKILL on `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Upper bound on collecting stderr of a forwarder that died during warm-up.
const STDERR_READ_LIMIT: Duration = Duration::from_secs(1);

/// Lifecycle of the bridge process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No process has been launched, or the last one was stopped.
    NotStarted,
    /// A process is launched and warming up.
    Starting,
    /// The process reported readiness.
    Running,
    /// Startup failed; `stop()` is required before another attempt.
    Failed,
}

/// Something that provides the local path to the broker.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Make sure the bridge is running, starting it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be brought up.
    async fn ensure_running(&self) -> Result<()>;
}

/// The program and arguments that implement the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to it.
    pub args: Vec<String>,
}

impl BridgeCommand {
    /// A custom forwarder command.
    #[must_use]
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `kubectl port-forward` to the broker service described by `config`.
    #[must_use]
    pub fn port_forward(config: &BridgeConfig) -> Self {
        let mut args = Vec::new();
        if let Some(context) = &config.context {
            args.push(format!("--context={context}"));
        }
        args.push(format!("--namespace={}", config.namespace));
        args.push("port-forward".to_string());
        args.push(config.service.clone());
        args.push(format!("{}:{}", config.local_port, config.remote_port));

        Self {
            program: config.kubectl.clone(),
            args,
        }
    }
}

struct BridgeProcess {
    child: Child,
    pgid: Pid,
}

struct Inner {
    state: BridgeState,
    process: Option<BridgeProcess>,
}

/// Owns the single local forwarder process of a run.
pub struct BridgeSupervisor {
    command: BridgeCommand,
    warmup: Duration,
    readiness_timeout: Duration,
    readiness_marker: String,
    inner: Mutex<Inner>,
    spawns: AtomicU32,
}

impl BridgeSupervisor {
    /// Create a supervisor running `kubectl port-forward` per `config`.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self::with_command(BridgeCommand::port_forward(config), config)
    }

    /// Create a supervisor running a custom forwarder command.
    ///
    /// Timing and the readiness marker still come from `config`.
    #[must_use]
    pub fn with_command(command: BridgeCommand, config: &BridgeConfig) -> Self {
        Self {
            command,
            warmup: config.warmup(),
            readiness_timeout: config.readiness_timeout(),
            readiness_marker: config.readiness_marker.clone(),
            inner: Mutex::new(Inner {
                state: BridgeState::NotStarted,
                process: None,
            }),
            spawns: AtomicU32::new(0),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> BridgeState {
        self.inner.lock().await.state
    }

    /// PID of the running forwarder, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .await
            .process
            .as_ref()
            .and_then(|p| p.child.id())
    }

    /// Number of processes spawned over the lifetime of this supervisor.
    #[must_use]
    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Start the forwarder unless it is already running.
    ///
    /// Concurrent callers are serialized; exactly one process is spawned.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned, exits during
    /// warm-up, or does not print the readiness marker in time. After a
    /// failure every further `start()` fails until `stop()` is called.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            BridgeState::Running => {
                debug!("Bridge already running");
                return Ok(());
            }
            BridgeState::Failed => return Err(BridgeError::PreviouslyFailed),
            BridgeState::NotStarted | BridgeState::Starting => {}
        }

        inner.state = BridgeState::Starting;
        match self.launch().await {
            Ok(process) => {
                inner.process = Some(process);
                inner.state = BridgeState::Running;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Bridge failed to start");
                inner.state = BridgeState::Failed;
                Err(e)
            }
        }
    }

    /// Terminate the forwarder's process group and forget it.
    ///
    /// Does nothing when no process is held. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BridgeState::NotStarted;

        let Some(mut process) = inner.process.take() else {
            return;
        };

        info!(pgid = %process.pgid, "Stopping bridge");
        signal_group(process.pgid, Signal::SIGTERM);

        if timeout(STOP_GRACE, process.child.wait()).await.is_err() {
            warn!(pgid = %process.pgid, "Bridge ignored SIGTERM, killing");
            signal_group(process.pgid, Signal::SIGKILL);
            let _ = process.child.wait().await;
        }
    }

    async fn launch(&self) -> Result<BridgeProcess> {
        info!(
            program = %self.command.program,
            args = ?self.command.args,
            "Starting bridge"
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        // A process group created with process_group(0) takes the child's PID.
        let pid = child.id().unwrap_or_default();
        let pgid = Pid::from_raw(i32::try_from(pid).unwrap_or_default());
        let process = BridgeProcess { child, pgid };

        debug!(pid, warmup = ?self.warmup, "Bridge warming up");
        sleep(self.warmup).await;

        match self.await_ready(process).await {
            Ok(process) => {
                info!(pid, "Bridge is up and running");
                Ok(process)
            }
            Err((mut process, e)) => {
                signal_group(process.pgid, Signal::SIGTERM);
                let _ = timeout(STOP_GRACE, process.child.wait()).await;
                Err(e)
            }
        }
    }

    async fn await_ready(
        &self,
        mut process: BridgeProcess,
    ) -> std::result::Result<BridgeProcess, (BridgeProcess, BridgeError)> {
        match process.child.try_wait() {
            Ok(Some(status)) => {
                let stderr = match process.child.stderr.take() {
                    Some(stderr) => read_bounded(stderr).await,
                    None => String::new(),
                };
                return Err((
                    process,
                    BridgeError::EarlyExit {
                        status: status.to_string(),
                        stderr,
                    },
                ));
            }
            Ok(None) => {}
            Err(e) => return Err((process, e.into())),
        }

        let Some(stdout) = process.child.stdout.take() else {
            return Err((process, BridgeError::NotReady { line: String::new() }));
        };
        let mut lines = BufReader::new(stdout).lines();

        let line = match timeout(self.readiness_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err((process, BridgeError::NotReady { line: String::new() })),
            Ok(Err(e)) => return Err((process, e.into())),
            Err(_) => {
                return Err((
                    process,
                    BridgeError::ReadinessTimeout(self.readiness_timeout),
                ))
            }
        };

        if !line.contains(&self.readiness_marker) {
            return Err((process, BridgeError::NotReady { line }));
        }
        debug!(line = %line, "Bridge reported readiness");

        // Keep the pipes drained so the forwarder never blocks on a full buffer.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(line = %line, "bridge stdout");
            }
        });
        if let Some(stderr) = process.child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "bridge stderr");
                }
            });
        }

        Ok(process)
    }
}

#[async_trait]
impl Bridge for BridgeSupervisor {
    async fn ensure_running(&self) -> Result<()> {
        self.start().await
    }
}

impl Drop for BridgeSupervisor {
    fn drop(&mut self) {
        if let Some(process) = self.inner.get_mut().process.take() {
            info!(pgid = %process.pgid, "Tearing down bridge");
            signal_group(process.pgid, Signal::SIGTERM);
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    if pgid.as_raw() <= 0 {
        return;
    }
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = %pgid, error = %e, "Failed to signal bridge process group"),
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = String::new();
    let _ = timeout(STDERR_READ_LIMIT, reader.read_to_string(&mut buf)).await;
    buf.trim().to_string()
}
