//! deadend - reach devices without inbound connectivity.
//!
//! This is the entry point for the `deadend` binary.
//!
//! ```text
//! deadend exec fleet_a-cam-01 -- uptime
//! deadend tunnel status fleet-a/cam-01
//! deadend tunnel open fleet-a/cam-01 --port 40001
//! deadend tunnel close fleet-a/cam-01
//! deadend bridge check
//! ```

mod commands;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deadend_bridge::BridgeSupervisor;
use deadend_connect::SshTransport;
use deadend_core::{DeadendConfig, DeviceKey};
use deadend_registry::{KubeRegistry, TunnelStore};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// deadend - reach devices without inbound connectivity.
#[derive(Parser, Debug)]
#[command(name = "deadend")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubeconfig context for the registry and the bridge.
    #[arg(long, global = true, env = "DEADEND_KUBE_CONTEXT")]
    context: Option<String>,

    /// Enable debug logging.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command on a device, by inventory hostname.
    Exec {
        /// Inventory hostname, e.g. `fleet_a-cam-01`.
        hostname: String,
        /// Command to run on the device.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Inspect or change a device's tunnel.
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Manage the local bridge.
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelAction {
    /// Show the recorded tunnel state.
    Status {
        /// Device as `namespace/name`.
        device: DeviceKey,
    },
    /// Ask the device to open its tunnel.
    Open {
        /// Device as `namespace/name`.
        device: DeviceKey,
        /// Port to request; the recorded or a random port when unset.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Ask the device to close its tunnel.
    Close {
        /// Device as `namespace/name`.
        device: DeviceKey,
    },
}

#[derive(Subcommand, Debug)]
enum BridgeAction {
    /// Start the bridge, report it and stop it again.
    Check,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut config = DeadendConfig::from_env().context("invalid configuration")?;
    if let Some(context) = args.context {
        config.registry.context = Some(context.clone());
        config.bridge.context = Some(context);
    }

    let shutdown = shutdown_signal().context("cannot install signal handlers")?;
    let bridge = Arc::new(BridgeSupervisor::new(&config.bridge));
    commands::supervised(
        &bridge,
        dispatch(&config, args.command, Arc::clone(&bridge)),
        shutdown,
    )
    .await
}

async fn dispatch(
    config: &DeadendConfig,
    command: Command,
    bridge: Arc<BridgeSupervisor>,
) -> anyhow::Result<ExitCode> {
    match command {
        Command::Exec { hostname, command } => {
            let registry = Arc::new(KubeRegistry::new(&config.registry).await?);
            let tunnels = Arc::new(TunnelStore::new(registry));
            let transport = SshTransport::new(&config.connection, config.bridge.local_port);

            let output =
                commands::exec(config, tunnels, bridge, transport, &hostname, &command.join(" "))
                    .await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(u8::try_from(output.status).map_or(ExitCode::FAILURE, ExitCode::from))
        }
        Command::Tunnel { action } => {
            let registry = Arc::new(KubeRegistry::new(&config.registry).await?);
            let tunnels = TunnelStore::new(registry);
            let report = match action {
                TunnelAction::Status { device } => commands::tunnel_status(&tunnels, &device).await?,
                TunnelAction::Open { device, port } => {
                    commands::tunnel_open(&tunnels, &device, port).await?
                }
                TunnelAction::Close { device } => commands::tunnel_close(&tunnels, &device).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Bridge {
            action: BridgeAction::Check,
        } => {
            bridge.start().await?;
            println!(
                "bridge running on 127.0.0.1:{} (pid {})",
                config.bridge.local_port,
                bridge.pid().await.unwrap_or_default()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Resolves with the name of the first termination signal received.
///
/// The forwarder lives in its own process group, so terminal signals never
/// reach it; handlers are installed before any command runs.
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        }
    })
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}
