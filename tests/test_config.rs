use std::io::Write;
use std::time::Duration;

use rackflow::cli::RackflowConfig;
use rackflow::engine::factory::StepDefaults;
use tempfile::NamedTempFile;

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 8080
store_dir: "custom/workflows"
database_url: "sqlite://servers.db?mode=rwc"
max_concurrent_workflows: 8
maas:
  url: "http://maas.local:5240/MAAS"
  api_key: "consumer:token:secret"
redfish:
  username: "root"
  accept_invalid_certs: true
  timeout_secs: 45
  firmware_image_url: "http://images.local/{component}/{version}.bin"
ipmi:
  username: "ADMIN"
  channel: 2
steps:
  timeout_secs: 120
  commission_timeout_secs: 900
  retries: 4
  retry_delay_secs: 0.5
  poll_interval_secs: 2
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = RackflowConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.store_dir.as_deref(), Some("custom/workflows"));
    assert_eq!(cfg.database_url.as_deref(), Some("sqlite://servers.db?mode=rwc"));
    assert_eq!(cfg.max_concurrent_workflows(), 8);

    let maas = cfg.maas.as_ref().unwrap();
    assert_eq!(maas.url, "http://maas.local:5240/MAAS");
    assert_eq!(maas.api_key.as_deref(), Some("consumer:token:secret"));

    let redfish = cfg.redfish.as_ref().unwrap();
    assert_eq!(redfish.username.as_deref(), Some("root"));
    assert_eq!(redfish.accept_invalid_certs, Some(true));
    assert_eq!(redfish.timeout_secs, Some(45));
    assert!(redfish.password.is_none());

    let ipmi = cfg.ipmi.as_ref().unwrap();
    assert_eq!(ipmi.channel, Some(2));
    assert!(ipmi.interface.is_none());

    let defaults = cfg.step_defaults();
    assert_eq!(defaults.timeout, Duration::from_secs(120));
    assert_eq!(defaults.commission_timeout, Duration::from_secs(900));
    assert_eq!(defaults.firmware_timeout, StepDefaults::default().firmware_timeout);
    assert_eq!(defaults.retries, 4);
    assert_eq!(defaults.retry_delay, Duration::from_millis(500));
    assert_eq!(defaults.poll_interval, Duration::from_secs(2));
}

#[test]
fn load_partial_config() {
    let yaml = r#"
port: 9090
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = RackflowConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.store_dir.is_none());
    assert!(cfg.database_url.is_none());
    assert!(cfg.maas.is_none());
    assert!(cfg.redfish.is_none());
    assert!(cfg.ipmi.is_none());
    assert_eq!(cfg.step_defaults(), StepDefaults::default());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = RackflowConfig::load(Some(std::path::Path::new("/nonexistent/rackflow.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn default_config_is_empty() {
    let cfg = RackflowConfig::default();
    assert!(cfg.host.is_none());
    assert!(cfg.port.is_none());
    assert!(cfg.max_concurrent_workflows.is_none());
    assert!(cfg.max_concurrent_workflows() >= 1);
}

#[test]
fn zero_concurrency_falls_back_to_cpu_count() {
    let cfg = RackflowConfig::parse("max_concurrent_workflows: 0").unwrap();
    assert_eq!(cfg.max_concurrent_workflows(), num_cpus::get());
}

#[test]
fn invalid_yaml_returns_error() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"port: [not, a, port]").unwrap();

    let err = RackflowConfig::load(Some(f.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[tokio::test]
async fn simulate_uses_in_memory_collaborators() {
    let cfg = RackflowConfig::parse(
        r#"
maas:
  url: "http://unreachable.invalid"
"#,
    )
    .unwrap();

    let clients = cfg.collaborators(true).await.unwrap();
    assert_eq!(clients.bios.protocol(), "memory-bios");
    assert_eq!(clients.bmc.protocol(), "memory-bmc");
    assert_eq!(clients.firmware.protocol(), "memory-firmware");
}

#[tokio::test]
async fn unconfigured_sections_are_simulated() {
    let cfg = RackflowConfig::parse(
        r#"
redfish:
  username: "root"
  password: "calvin"
"#,
    )
    .unwrap();

    let clients = cfg.collaborators(false).await.unwrap();
    assert_eq!(clients.bios.protocol(), "redfish-bios");
    assert_eq!(clients.bmc.protocol(), "memory-bmc");
    // No image template, so firmware stays simulated.
    assert_eq!(clients.firmware.protocol(), "memory-firmware");
}
