//! End-to-end inventory generation against an in-memory registry.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use deadend_core::{encode_secret, DeadendConfig};
use deadend_inventory::{assemble, CredentialProvisioner, KEY_FILE_MODE};
use deadend_registry::{Device, MockRegistry, SecretBundle, TunnelStore};

fn device(name: &str, labels: &[(&str, &str)], password: Option<&str>) -> Device {
    Device::with_identity(
        "fleet-a",
        name,
        labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>(),
        SecretBundle {
            rsa_private: Some(encode_secret(&format!("-----BEGIN KEY {name}-----\n"))),
            username: Some(encode_secret("pi")),
            userpassword: password.map(encode_secret),
            tunnel: None,
        },
    )
}

fn fleet() -> MockRegistry {
    MockRegistry::with_devices([
        device("cam-01", &[("site", "north")], Some("pw1")),
        device("cam-02", &[("site", "south"), ("model", "rpi-4")], Some("pw2")),
        device("cam-03", &[("site", "north")], None),
    ])
}

fn provisioner(cache: &std::path::Path) -> CredentialProvisioner<MockRegistry> {
    let mut config = DeadendConfig::default();
    config.inventory.cache_dir = cache.to_path_buf();
    CredentialProvisioner::new(Arc::new(TunnelStore::new(Arc::new(fleet()))), &config)
}

#[tokio::test]
async fn device_missing_password_is_left_out_of_hostvars_only() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = assemble(provisioner(dir.path()).provision_all().await.unwrap());

    assert_eq!(inventory.meta.hostvars.len(), 2);
    assert!(inventory.host("fleet_a-cam-01").is_some());
    assert!(inventory.host("fleet_a-cam-02").is_some());
    assert!(inventory.host("fleet_a-cam-03").is_none());

    assert_eq!(
        inventory.groups["fleet_a"].hosts,
        vec!["fleet_a-cam-01", "fleet_a-cam-02", "fleet_a-cam-03"]
    );
    assert_eq!(
        inventory.groups["site_north"].hosts,
        vec!["fleet_a-cam-01", "fleet_a-cam-03"]
    );
    assert_eq!(inventory.groups["site_south"].hosts, vec!["fleet_a-cam-02"]);
    assert_eq!(inventory.groups["model_rpi_4"].hosts, vec!["fleet_a-cam-02"]);
    assert!(inventory.groups.values().all(|g| g.vars.is_empty()));

    assert_eq!(inventory.meta.hostvars["fleet_a-cam-01"].ansible_port, 2200);
    assert_eq!(inventory.meta.hostvars["fleet_a-cam-02"].ansible_port, 2201);
}

#[tokio::test]
async fn second_run_keeps_cached_keys_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("fleet-a").join("cam-01.pem");

    let first = assemble(provisioner(dir.path()).provision_all().await.unwrap());
    let content = fs::read_to_string(&key_file).unwrap();
    let mode = fs::metadata(&key_file).unwrap().permissions().mode() & 0o777;
    let second = assemble(provisioner(dir.path()).provision_all().await.unwrap());

    assert_eq!(content, "-----BEGIN KEY cam-01-----\n");
    assert_eq!(mode, KEY_FILE_MODE);
    assert_eq!(fs::read_to_string(&key_file).unwrap(), content);
    assert_eq!(
        fs::metadata(&key_file).unwrap().permissions().mode() & 0o777,
        mode
    );
    assert!(!dir.path().join("fleet-a").join("cam-03.pem").exists());

    assert_eq!(first.groups, second.groups);
    assert_eq!(
        first.meta.hostvars.keys().collect::<Vec<_>>(),
        second.meta.hostvars.keys().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn rendered_document_has_the_expected_shape() {
    let dir = tempfile::tempdir().unwrap();
    let json = assemble(provisioner(dir.path()).provision_all().await.unwrap())
        .to_json()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    let host = &value["_meta"]["hostvars"]["fleet_a-cam-01"];
    assert_eq!(host["ansible_connection"], "deadend");
    assert_eq!(host["ansible_host"], "localhost");
    assert_eq!(host["ansible_become"], "yes");
    assert_eq!(host["ansible_deadend_device"], "cam-01");
    assert_eq!(host["ansible_kubectl_namespace"], "fleet-a");
    assert_eq!(host["ansible_deadend_tunnel_open"], false);
    assert!(host["ansible_deadend_tunnel_port"].as_u64().is_some());
    assert!(json.contains("\n    \"_meta\": {\n"));
}
