//! deadend-inventory - Ansible dynamic inventory for deadend device fleets.
//!
//! - `--list`: the full inventory
//! - `--host <name>`: also the full inventory, hostvars are served via `_meta`
//! - no flag: an empty inventory
//!
//! The document goes to stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use deadend_core::DeadendConfig;
use deadend_inventory::{assemble, empty_inventory, CredentialProvisioner, Inventory};
use deadend_registry::{KubeRegistry, TunnelStore};
use kube::config::Kubeconfig;
use tracing_subscriber::EnvFilter;

/// Ansible dynamic inventory for deadend device fleets.
#[derive(Parser, Debug)]
#[command(name = "deadend-inventory")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print the full inventory.
    #[arg(long)]
    list: bool,

    /// Print the inventory for a host (the full inventory is returned).
    #[arg(long, value_name = "HOSTNAME")]
    host: Option<String>,

    /// Kubeconfig context to read devices from.
    #[arg(long, env = "DEADEND_KUBE_CONTEXT")]
    context: Option<String>,

    /// Only list devices in this namespace.
    #[arg(long, env = "DEADEND_NAMESPACE")]
    namespace: Option<String>,

    /// Root of the local credential cache.
    #[arg(long, env = "DEADEND_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Inventory generation failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<String> {
    if !args.list && args.host.is_none() {
        return Ok(empty_inventory().to_json()?);
    }
    if let Some(host) = &args.host {
        tracing::debug!(host = %host, "Host lookup answered with the full inventory");
    }

    let mut config = DeadendConfig::from_env()?;
    if let Some(context) = args.context {
        config.registry.context = Some(context.clone());
        config.bridge.context = Some(context);
    }
    if args.namespace.is_some() {
        config.registry.namespace = args.namespace;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.inventory.cache_dir = cache_dir;
    }
    config.validate()?;

    let inventory = build(&config).await?;
    Ok(inventory.to_json()?)
}

async fn build(config: &DeadendConfig) -> anyhow::Result<Inventory> {
    let registry = Arc::new(KubeRegistry::new(&config.registry).await?);
    let tunnels = Arc::new(TunnelStore::new(registry));

    let context = config.registry.context.clone().or_else(current_context);
    let provisioner = CredentialProvisioner::new(tunnels, config).with_context(context);

    Ok(assemble(provisioner.provision_all().await?))
}

fn current_context() -> Option<String> {
    Kubeconfig::read().ok().and_then(|k| k.current_context)
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
