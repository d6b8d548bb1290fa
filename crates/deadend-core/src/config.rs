//! Run configuration.
//!
//! [`DeadendConfig`] is assembled once per invocation, from defaults overlaid
//! with `DEADEND_*` environment variables, and validated before any device is
//! touched. Components receive the section they need by reference.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Complete configuration for a deadend run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadendConfig {
    /// Device registry access.
    pub registry: RegistryConfig,
    /// Local bridge to the tunnel broker.
    pub bridge: BridgeConfig,
    /// Inventory generation.
    pub inventory: InventoryConfig,
    /// Per-device connection behaviour.
    pub connection: ConnectionConfig,
}

/// Where device records are read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Kubeconfig context to use; the current context when unset.
    pub context: Option<String>,
    /// Restrict listings to one namespace; all namespaces when unset.
    pub namespace: Option<String>,
}

/// How the local bridge process is launched and checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// The `kubectl` executable.
    pub kubectl: String,
    /// Kubeconfig context passed to `kubectl`.
    pub context: Option<String>,
    /// Namespace of the broker service.
    pub namespace: String,
    /// Broker service reference, e.g. `svc/deadendproxy`.
    pub service: String,
    /// Local port the bridge listens on.
    pub local_port: u16,
    /// Port of the broker service.
    pub remote_port: u16,
    /// Time given to the forwarder before its output is inspected.
    pub warmup_ms: u64,
    /// Upper bound on waiting for the readiness line.
    pub readiness_timeout_ms: u64,
    /// Prefix of the line the forwarder prints once it is listening.
    pub readiness_marker: String,
}

impl BridgeConfig {
    /// Warm-up interval as a `Duration`.
    #[must_use]
    pub const fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Readiness timeout as a `Duration`.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
            namespace: "deadend-system".to_string(),
            service: "svc/deadendproxy".to_string(),
            local_port: 8118,
            remote_port: 8118,
            warmup_ms: 4_000,
            readiness_timeout_ms: 10_000,
            readiness_marker: "Forwarding from".to_string(),
        }
    }
}

/// Inventory document settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Root of the local credential cache.
    pub cache_dir: PathBuf,
    /// First target port handed out to emitted hosts.
    pub base_port: u16,
    /// Connection plugin name written to `ansible_connection`.
    pub connection_kind: String,
    /// Interpreter used on the devices.
    pub python_interpreter: String,
    /// Account used for privilege escalation.
    pub become_user: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("inv"),
            base_port: 2200,
            connection_kind: "deadend".to_string(),
            python_interpreter: "/usr/bin/python3".to_string(),
            become_user: "root".to_string(),
        }
    }
}

/// Transport connect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect attempts before giving up.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
    /// Per-attempt connect timeout handed to the transport.
    pub connect_timeout_secs: u64,
    /// The `ssh` executable.
    pub ssh_executable: String,
    /// Host the broker exposes reverse tunnels on.
    pub broker_host: String,
    /// Extra arguments for every `ssh` invocation.
    pub ssh_args: Vec<String>,
    /// Verify device host keys.
    pub host_key_checking: bool,
}

impl ConnectionConfig {
    /// Delay between attempts as a `Duration`.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retries: 20,
            retry_delay_ms: 3_000,
            connect_timeout_secs: 10,
            ssh_executable: "ssh".to_string(),
            broker_host: "localhost".to_string(),
            ssh_args: vec![
                "-C".to_string(),
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                "ControlPersist=60s".to_string(),
            ],
            host_key_checking: false,
        }
    }
}

impl DeadendConfig {
    /// Load configuration from the process environment and validate it.
    ///
    /// Supported environment variables:
    /// - `DEADEND_KUBE_CONTEXT`: kubeconfig context for the registry and the bridge
    /// - `DEADEND_NAMESPACE`: restrict device listings to one namespace
    /// - `DEADEND_KUBECTL`: `kubectl` executable
    /// - `DEADEND_BRIDGE_NAMESPACE`: namespace of the broker service
    /// - `DEADEND_BRIDGE_SERVICE`: broker service reference
    /// - `DEADEND_BRIDGE_LOCAL_PORT` / `DEADEND_BRIDGE_REMOTE_PORT`
    /// - `DEADEND_BRIDGE_WARMUP_MS` / `DEADEND_BRIDGE_READY_TIMEOUT_MS`
    /// - `DEADEND_CACHE_DIR`: credential cache root
    /// - `DEADEND_BASE_PORT`: first inventory target port
    /// - `DEADEND_SSH_RETRIES` / `DEADEND_RETRY_DELAY_MS`
    /// - `DEADEND_SSH_EXECUTABLE` / `DEADEND_BROKER_HOST`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("DEADEND_KUBE_CONTEXT") {
            config.registry.context = Some(val.clone());
            config.bridge.context = Some(val);
        }
        if let Some(val) = lookup("DEADEND_NAMESPACE") {
            config.registry.namespace = Some(val);
        }
        if let Some(val) = lookup("DEADEND_KUBECTL") {
            config.bridge.kubectl = val;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_NAMESPACE") {
            config.bridge.namespace = val;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_SERVICE") {
            config.bridge.service = val;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_LOCAL_PORT") {
            config.bridge.local_port = parse("DEADEND_BRIDGE_LOCAL_PORT", &val)?;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_REMOTE_PORT") {
            config.bridge.remote_port = parse("DEADEND_BRIDGE_REMOTE_PORT", &val)?;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_WARMUP_MS") {
            config.bridge.warmup_ms = parse("DEADEND_BRIDGE_WARMUP_MS", &val)?;
        }
        if let Some(val) = lookup("DEADEND_BRIDGE_READY_TIMEOUT_MS") {
            config.bridge.readiness_timeout_ms = parse("DEADEND_BRIDGE_READY_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = lookup("DEADEND_CACHE_DIR") {
            config.inventory.cache_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("DEADEND_BASE_PORT") {
            config.inventory.base_port = parse("DEADEND_BASE_PORT", &val)?;
        }
        if let Some(val) = lookup("DEADEND_SSH_RETRIES") {
            config.connection.retries = parse("DEADEND_SSH_RETRIES", &val)?;
        }
        if let Some(val) = lookup("DEADEND_RETRY_DELAY_MS") {
            config.connection.retry_delay_ms = parse("DEADEND_RETRY_DELAY_MS", &val)?;
        }
        if let Some(val) = lookup("DEADEND_SSH_EXECUTABLE") {
            config.connection.ssh_executable = val;
        }
        if let Some(val) = lookup("DEADEND_BROKER_HOST") {
            config.connection.broker_host = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the components cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        let bridge = &self.bridge;
        if bridge.kubectl.trim().is_empty() {
            return Err(ConfigError::invalid("bridge.kubectl", "must not be empty"));
        }
        if bridge.service.trim().is_empty() {
            return Err(ConfigError::invalid("bridge.service", "must not be empty"));
        }
        if bridge.local_port == 0 || bridge.remote_port == 0 {
            return Err(ConfigError::invalid("bridge.local_port", "ports must be non-zero"));
        }
        if bridge.readiness_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "bridge.readiness_timeout_ms",
                "must be greater than zero",
            ));
        }
        if bridge.readiness_marker.is_empty() {
            return Err(ConfigError::invalid(
                "bridge.readiness_marker",
                "must not be empty",
            ));
        }

        if self.inventory.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("inventory.cache_dir", "must not be empty"));
        }
        if self.inventory.base_port == 0 {
            return Err(ConfigError::invalid("inventory.base_port", "must be non-zero"));
        }

        let connection = &self.connection;
        if connection.retries == 0 {
            return Err(ConfigError::invalid(
                "connection.retries",
                "at least one attempt is required",
            ));
        }
        if connection.ssh_executable.trim().is_empty() {
            return Err(ConfigError::invalid(
                "connection.ssh_executable",
                "must not be empty",
            ));
        }
        if connection.broker_host.trim().is_empty() {
            return Err(ConfigError::invalid(
                "connection.broker_host",
                "must not be empty",
            ));
        }

        Ok(())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = DeadendConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge.local_port, 8118);
        assert_eq!(config.bridge.warmup(), Duration::from_secs(4));
        assert_eq!(config.bridge.readiness_marker, "Forwarding from");
        assert_eq!(config.inventory.base_port, 2200);
        assert_eq!(config.connection.retries, 20);
    }

    #[test]
    fn environment_overrides() {
        let config = DeadendConfig::from_lookup(lookup_from(&[
            ("DEADEND_KUBE_CONTEXT", "prod"),
            ("DEADEND_BRIDGE_LOCAL_PORT", "9118"),
            ("DEADEND_SSH_RETRIES", "5"),
            ("DEADEND_CACHE_DIR", "/tmp/keys"),
        ]))
        .unwrap();

        assert_eq!(config.registry.context.as_deref(), Some("prod"));
        assert_eq!(config.bridge.context.as_deref(), Some("prod"));
        assert_eq!(config.bridge.local_port, 9118);
        assert_eq!(config.connection.retries, 5);
        assert_eq!(config.inventory.cache_dir, PathBuf::from("/tmp/keys"));
    }

    #[test]
    fn unparsable_variable_is_reported() {
        let err = DeadendConfig::from_lookup(lookup_from(&[(
            "DEADEND_BRIDGE_LOCAL_PORT",
            "eighty",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                var: "DEADEND_BRIDGE_LOCAL_PORT",
                value: "eighty".to_string()
            }
        );
    }

    #[test]
    fn zero_retries_rejected() {
        let err =
            DeadendConfig::from_lookup(lookup_from(&[("DEADEND_SSH_RETRIES", "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "connection.retries",
                ..
            }
        ));
    }

    #[test]
    fn zero_readiness_timeout_rejected() {
        let mut config = DeadendConfig::default();
        config.bridge.readiness_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
