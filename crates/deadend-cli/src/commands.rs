//! Subcommand implementations.
//!
//! Everything that talks to the cluster goes through the registry and bridge
//! seams, so the logic here runs against the in-memory registry in tests.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use deadend_bridge::{Bridge, BridgeSupervisor};
use deadend_connect::{BootstrapConnection, ExecOutput, Login, Transport};
use deadend_core::{hostname_for, DeadendConfig, DeviceKey};
use deadend_inventory::CredentialProvisioner;
use deadend_registry::{Device, DeviceRegistry, TunnelStore};
use serde::Serialize;
use tracing::info;

/// Tunnel state as printed by `deadend tunnel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelReport {
    /// `namespace/name` of the device.
    pub device: String,
    /// Whether the tunnel is recorded as open.
    pub open: bool,
    /// Recorded or requested port.
    pub port: Option<u16>,
}

/// Find the device whose inventory hostname is `hostname`.
///
/// When namespaces collide after normalization the first device in
/// `(namespace, name)` order wins, as in the inventory.
pub fn find_by_hostname<'a>(devices: &'a [Device], hostname: &str) -> Option<&'a Device> {
    devices
        .iter()
        .filter_map(|d| d.key().ok().map(|k| (k, d)))
        .filter(|(k, _)| hostname_for(k) == hostname)
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, d)| d)
}

/// Run `work` until it completes or `shutdown` fires, then stop the bridge.
///
/// The bridge is stopped on every path out of here, including errors and
/// interrupts.
///
/// # Errors
///
/// Returns the error of `work`, or an error naming the signal if `shutdown`
/// fired first.
pub async fn supervised<T>(
    bridge: &BridgeSupervisor,
    work: impl Future<Output = anyhow::Result<T>>,
    shutdown: impl Future<Output = &'static str>,
) -> anyhow::Result<T> {
    let result = tokio::select! {
        r = work => r,
        signal = shutdown => {
            info!(signal, "Interrupted, shutting down");
            Err(anyhow!("interrupted by {signal}"))
        }
    };
    bridge.stop().await;
    result
}

/// Report the tunnel of `key` exactly as recorded.
pub async fn tunnel_status<R>(tunnels: &TunnelStore<R>, key: &DeviceKey) -> anyhow::Result<TunnelReport>
where
    R: DeviceRegistry + ?Sized,
{
    let desc = tunnels.status(key).await?;
    Ok(TunnelReport {
        device: key.to_string(),
        open: desc.open,
        port: desc.port,
    })
}

/// Request a tunnel on `port`, or on the recorded or a fresh port when unset.
pub async fn tunnel_open<R>(
    tunnels: &TunnelStore<R>,
    key: &DeviceKey,
    port: Option<u16>,
) -> anyhow::Result<TunnelReport>
where
    R: DeviceRegistry + ?Sized,
{
    let port = match port {
        Some(port) if port < deadend_core::tunnel::MIN_TUNNEL_PORT => {
            bail!("tunnel port {port} is below {}", deadend_core::tunnel::MIN_TUNNEL_PORT)
        }
        Some(port) => port,
        None => tunnels
            .read(key)
            .await?
            .port
            .ok_or_else(|| anyhow!("no tunnel port available for {key}"))?,
    };

    tunnels.open(key, port).await?;
    Ok(TunnelReport {
        device: key.to_string(),
        open: true,
        port: Some(port),
    })
}

/// Ask the device to close its tunnel.
pub async fn tunnel_close<R>(tunnels: &TunnelStore<R>, key: &DeviceKey) -> anyhow::Result<TunnelReport>
where
    R: DeviceRegistry + ?Sized,
{
    tunnels.close(key).await?;
    Ok(TunnelReport {
        device: key.to_string(),
        open: false,
        port: None,
    })
}

/// Connect to the device behind `hostname` and run `command` on it.
pub async fn exec<R, B, T>(
    config: &DeadendConfig,
    tunnels: Arc<TunnelStore<R>>,
    bridge: Arc<B>,
    transport: T,
    hostname: &str,
    command: &str,
) -> anyhow::Result<ExecOutput>
where
    R: DeviceRegistry + ?Sized,
    B: Bridge + ?Sized,
    T: Transport,
{
    let devices = tunnels.registry().list_devices().await?;
    let device = find_by_hostname(&devices, hostname)
        .ok_or_else(|| anyhow!("no device with hostname {hostname}"))?;
    let key = device.key()?;

    let provisioner = CredentialProvisioner::new(Arc::clone(&tunnels), config);
    let record = provisioner
        .host_record(&key, device, config.inventory.base_port)
        .with_context(|| format!("cannot log in to {key}"))?;

    let login = Login {
        user: record.ansible_user,
        key_file: record.ansible_ssh_private_key_file,
    };
    let mut conn =
        BootstrapConnection::new(key.clone(), login, transport, bridge, tunnels, &config.connection);

    conn.connect().await?;
    info!(device = %key, port = ?conn.tunnel_port(), "Running command");
    let output = conn.exec(command).await;
    conn.close().await?;
    Ok(output?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deadend_bridge::{BridgeCommand, BridgeState};
    use deadend_connect::MockTransport;
    use deadend_core::tunnel::encode_port;
    use deadend_core::{encode_secret, BridgeConfig};
    use deadend_registry::{MockRegistry, SecretBundle};
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct StubBridge {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Bridge for StubBridge {
        async fn ensure_running(&self) -> deadend_bridge::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn login_device(namespace: &str, name: &str, password: Option<&str>) -> Device {
        Device::with_identity(
            namespace,
            name,
            BTreeMap::new(),
            SecretBundle {
                rsa_private: Some(encode_secret(&format!("key of {name}"))),
                username: Some(encode_secret("pi")),
                userpassword: password.map(encode_secret),
                tunnel: Some(encode_secret("NA")),
            },
        )
    }

    fn config_in(cache: &std::path::Path) -> DeadendConfig {
        let mut config = DeadendConfig::default();
        config.inventory.cache_dir = cache.to_path_buf();
        config
    }

    fn forwarder() -> BridgeSupervisor {
        let config = BridgeConfig {
            warmup_ms: 50,
            readiness_timeout_ms: 2_000,
            ..BridgeConfig::default()
        };
        BridgeSupervisor::with_command(
            BridgeCommand::new(
                "/bin/sh",
                ["-c", "echo 'Forwarding from 127.0.0.1:8118 -> 8118'; exec sleep 30"],
            ),
            &config,
        )
    }

    fn device(namespace: &str, name: &str, tunnel: Option<u16>) -> Device {
        Device::with_identity(
            namespace,
            name,
            BTreeMap::new(),
            SecretBundle {
                tunnel: tunnel.map(encode_port),
                ..Default::default()
            },
        )
    }

    fn store(devices: Vec<Device>) -> TunnelStore<MockRegistry> {
        TunnelStore::with_seed(Arc::new(MockRegistry::with_devices(devices)), 3)
    }

    #[test]
    fn hostname_lookup_uses_the_normalized_namespace() {
        let devices = vec![device("fleet-a", "cam-01", None), device("fleet-b", "cam-01", None)];

        let found = find_by_hostname(&devices, "fleet_b-cam-01").unwrap();
        assert_eq!(found.key().unwrap().namespace(), "fleet-b");
        assert!(find_by_hostname(&devices, "fleet-b-cam-01").is_none());
    }

    #[test]
    fn colliding_hostnames_resolve_to_the_first_namespace() {
        let devices = vec![device("fleet.a", "cam-01", None), device("fleet-a", "cam-01", None)];

        let found = find_by_hostname(&devices, "fleet_a-cam-01").unwrap();
        assert_eq!(found.key().unwrap().namespace(), "fleet-a");
    }

    #[tokio::test]
    async fn signal_during_a_command_stops_the_bridge() {
        let bridge = forwarder();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let work = async {
            bridge.start().await?;
            let _ = started_tx.send(bridge.pid().await);
            std::future::pending::<anyhow::Result<()>>().await
        };
        let shutdown = async {
            let _ = started_rx.await;
            "SIGINT"
        };

        let err = supervised(&bridge, work, shutdown).await.unwrap_err();
        assert!(err.to_string().contains("SIGINT"));
        assert_eq!(bridge.state().await, BridgeState::NotStarted);
        assert_eq!(bridge.pid().await, None);
    }

    #[tokio::test]
    async fn finished_command_stops_the_bridge() {
        let bridge = forwarder();

        let pid = supervised(
            &bridge,
            async {
                bridge.start().await?;
                bridge.pid().await.ok_or_else(|| anyhow!("no pid"))
            },
            std::future::pending(),
        )
        .await
        .unwrap();

        let pid = Pid::from_raw(i32::try_from(pid).unwrap());
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
        assert_eq!(bridge.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_requests_the_tunnel_and_runs_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let tunnels = Arc::new(store(vec![login_device("fleet-a", "cam-01", Some("pw"))]));
        let bridge = Arc::new(StubBridge::default());
        let transport = MockTransport::failing(1);
        let log = transport.log();

        let output = exec(
            &config,
            Arc::clone(&tunnels),
            Arc::clone(&bridge),
            transport,
            "fleet_a-cam-01",
            "uptime",
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, "uptime\n");
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);

        let log = log.lock();
        assert_eq!(log.connects.len(), 2);
        assert_eq!(log.execs, vec!["uptime".to_string()]);
        assert_eq!(log.closes, 1);

        let target = &log.connects[0];
        assert_eq!(target.user, "pi");
        let key_file = dir.path().join("fleet-a").join("cam-01.pem");
        assert_eq!(target.key_file, key_file);
        assert_eq!(std::fs::read_to_string(&key_file).unwrap(), "key of cam-01");

        let patches = tunnels.registry().patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1, encode_port(target.port));
    }

    #[tokio::test(start_paused = true)]
    async fn exec_unknown_hostname_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tunnels = Arc::new(store(vec![login_device("fleet-a", "cam-01", Some("pw"))]));
        let bridge = Arc::new(StubBridge::default());

        let err = exec(
            &config_in(dir.path()),
            Arc::clone(&tunnels),
            Arc::clone(&bridge),
            MockTransport::reachable(),
            "fleet_a-cam-99",
            "uptime",
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("fleet_a-cam-99"));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
        assert!(tunnels.registry().patches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exec_without_password_does_not_connect() {
        let dir = tempfile::tempdir().unwrap();
        let tunnels = Arc::new(store(vec![login_device("fleet-a", "cam-01", None)]));
        let bridge = Arc::new(StubBridge::default());
        let transport = MockTransport::reachable();
        let log = transport.log();

        let err = exec(
            &config_in(dir.path()),
            Arc::clone(&tunnels),
            Arc::clone(&bridge),
            transport,
            "fleet_a-cam-01",
            "uptime",
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("userpassword"));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
        assert!(log.lock().connects.is_empty());
        assert!(tunnels.registry().patches().is_empty());
    }

    #[tokio::test]
    async fn status_does_not_invent_a_port() {
        let tunnels = store(vec![device("fleet-a", "cam-01", None)]);
        let key: DeviceKey = "fleet-a/cam-01".parse().unwrap();

        let report = tunnel_status(&tunnels, &key).await.unwrap();
        assert!(!report.open);
        assert_eq!(report.port, None);
    }

    #[tokio::test]
    async fn open_without_port_picks_one_and_records_it() {
        let tunnels = store(vec![device("fleet-a", "cam-01", None)]);
        let key: DeviceKey = "fleet-a/cam-01".parse().unwrap();

        let report = tunnel_open(&tunnels, &key, None).await.unwrap();
        let port = report.port.unwrap();
        assert!(port >= 1024);

        let status = tunnel_status(&tunnels, &key).await.unwrap();
        assert_eq!(status, TunnelReport { device: key.to_string(), open: true, port: Some(port) });
    }

    #[tokio::test]
    async fn open_rejects_privileged_ports() {
        let tunnels = store(vec![device("fleet-a", "cam-01", None)]);
        let key: DeviceKey = "fleet-a/cam-01".parse().unwrap();

        assert!(tunnel_open(&tunnels, &key, Some(22)).await.is_err());
        assert!(tunnels.registry().patches().is_empty());
    }

    #[tokio::test]
    async fn close_writes_the_sentinel() {
        let tunnels = store(vec![device("fleet-a", "cam-01", Some(40001))]);
        let key: DeviceKey = "fleet-a/cam-01".parse().unwrap();

        tunnel_close(&tunnels, &key).await.unwrap();
        assert_eq!(tunnels.registry().patches()[0].1, encode_secret("NA"));
    }
}
