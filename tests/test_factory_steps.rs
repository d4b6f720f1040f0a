//! End-to-end provisioning runs through the factory with in-memory
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use rackflow::clients::memory::{MemoryConfigClient, StaticCommissioning};
use rackflow::clients::{
    CommissionParams, CommissioningClient, Collaborators, Machine, RemoteConfigClient, RemoteTarget,
};
use rackflow::engine::factory::{ProvisioningParams, StepDefaults, WorkflowFactory, WorkflowType};
use rackflow::engine::progress::ProgressKind;
use rackflow::engine::types::*;
use rackflow::error::WorkflowError;
use rackflow::storage::ServerRepository;
use rackflow::storage::memory_servers::MemoryServerRepository;

fn settings(value: serde_json::Value) -> Settings {
    value.as_object().cloned().unwrap()
}

fn fast_defaults() -> StepDefaults {
    StepDefaults {
        timeout: Duration::from_secs(5),
        commission_timeout: Duration::from_secs(5),
        firmware_timeout: Duration::from_secs(5),
        retries: 0,
        retry_delay: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
    }
}

fn machine(id: &str, status: &str, ip: Option<&str>) -> Machine {
    Machine {
        system_id: id.to_string(),
        hostname: format!("{}.rack.local", id),
        status_name: status.to_string(),
        serial: Some("SN-7731".to_string()),
        ip_addresses: ip.map(|s| vec![s.to_string()]).unwrap_or_default(),
        power_state: Some("off".to_string()),
    }
}

struct Lab {
    commissioning: Arc<StaticCommissioning>,
    bios: Arc<MemoryConfigClient>,
    bmc: Arc<MemoryConfigClient>,
    firmware: Arc<MemoryConfigClient>,
    servers: Arc<MemoryServerRepository>,
}

impl Lab {
    fn new(commissioning: StaticCommissioning) -> Self {
        Self {
            commissioning: Arc::new(commissioning),
            bios: Arc::new(MemoryConfigClient::new("memory-bios").with_settings(
                "10.20.0.5",
                settings(json!({ "BootMode": "Legacy", "LogicalProc": "Enabled" })),
            )),
            bmc: Arc::new(MemoryConfigClient::new("memory-bmc")),
            firmware: Arc::new(MemoryConfigClient::new("memory-firmware").with_settings(
                "10.20.0.5",
                settings(json!({ "BIOS": "1.0.0", "iDRAC": "6.10.00.00" })),
            )),
            servers: Arc::new(MemoryServerRepository::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            commissioning: self.commissioning.clone(),
            bios: self.bios.clone(),
            bmc: self.bmc.clone(),
            firmware: self.firmware.clone(),
            servers: self.servers.clone(),
        }
    }

    fn factory(&self) -> WorkflowFactory {
        WorkflowFactory::new(self.collaborators()).with_defaults(fast_defaults())
    }
}

fn new_machine_lab() -> Lab {
    Lab::new(
        StaticCommissioning::strict()
            .with_machine(machine("srv-1", "New", Some("10.20.0.5")))
            .with_commission_polls(1),
    )
}

fn full_params() -> ProvisioningParams {
    let mut params = ProvisioningParams::new("srv-1", "r650");
    params.rack_location = RackLocation::parse("dc1/r12:7");
    params.bios_settings = settings(json!({ "BootMode": "Uefi", "LogicalProc": "Enabled" }));
    params.bmc_settings = settings(json!({ "ip_source": "static", "ip_address": "10.30.0.5" }));
    params.firmware = settings(json!({ "BIOS": "2.19.1", "iDRAC": "6.10.00.00" }));
    params
}

// --- Factory shape ---

#[test]
fn workflow_types_have_fixed_step_sequences() {
    let names = |t| -> Vec<&'static str> { WorkflowFactory::describe(t).into_iter().map(|(n, _)| n).collect() };

    assert_eq!(
        names(WorkflowType::Standard),
        vec!["commission", "discover", "bios_pull", "bios_edit", "bios_push", "ipmi_configure", "finalize"]
    );
    assert_eq!(
        names(WorkflowType::FirmwareFirst),
        vec![
            "commission",
            "discover",
            "firmware_update",
            "bios_pull",
            "bios_edit",
            "bios_push",
            "ipmi_configure",
            "finalize"
        ]
    );
    assert_eq!(
        names(WorkflowType::BiosConfiguration),
        vec!["discover", "bios_pull", "bios_edit", "bios_push"]
    );
    assert_eq!(names(WorkflowType::IpmiSetup), vec!["discover", "ipmi_configure"]);
}

#[test]
fn workflow_type_names() {
    for t in WorkflowType::all() {
        assert_eq!(t.as_str().parse::<WorkflowType>().unwrap(), t);
        assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
    }
    assert!(matches!(
        "bogus".parse::<WorkflowType>(),
        Err(WorkflowError::UnknownWorkflowType(_))
    ));
}

#[test]
fn factory_applies_step_defaults() {
    let lab = new_machine_lab();
    let defaults = StepDefaults {
        retries: 3,
        ..fast_defaults()
    };
    let factory = WorkflowFactory::new(lab.collaborators()).with_defaults(defaults);

    let wf = factory.build("wf-1", WorkflowType::Standard, full_params());
    assert_eq!(wf.id(), "wf-1");
    assert_eq!(wf.workflow_type(), "standard");
    assert_eq!(wf.server_id(), "srv-1");
    assert_eq!(wf.device_type(), "r650");
    assert_eq!(wf.status(), WorkflowStatus::Pending);
    assert!(wf.steps().iter().all(|s| s.retry().retry_count == 3));
    assert_eq!(wf.steps()[0].timeout(), defaults.commission_timeout);

    assert!(factory.build_by_name("wf-2", "nope", full_params()).is_err());
}

// --- End to end ---

#[tokio::test]
async fn standard_workflow_provisions_a_new_machine() {
    let lab = new_machine_lab();
    let wf = lab.factory().build("wf-std", WorkflowType::Standard, full_params());

    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Completed);

    let snap = wf.snapshot();
    assert!(snap.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(snap.current_step_index, Some(7));
    assert_eq!(snap.step("commission").unwrap().result.as_ref().unwrap()["commissioned"], json!(true));
    assert_eq!(lab.commissioning.commission_count(), 1);

    // Only the changed BIOS attribute is pushed.
    let applied = lab.bios.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, "10.20.0.5");
    assert_eq!(applied[0].1, settings(json!({ "BootMode": "Uefi" })));
    assert_eq!(lab.bios.current("10.20.0.5")["BootMode"], json!("Uefi"));

    assert_eq!(lab.bmc.current("10.20.0.5")["ip_address"], json!("10.30.0.5"));

    let record = lab.servers.get_server("srv-1").await.unwrap().unwrap();
    assert_eq!(record["status"], json!("provisioned"));
    assert_eq!(record["ip_address"], json!("10.20.0.5"));
    assert_eq!(record["serial"], json!("SN-7731"));
    assert_eq!(record["rack_location"], json!("dc1/r12:7"));
    assert_eq!(record["bmc_configured"], json!(true));
    assert!(record.contains_key("bios_configured_at"));
    assert!(record.contains_key("provisioned_at"));

    let data = wf.context_data().await.unwrap();
    assert_eq!(data["ip_address"], json!("10.20.0.5"));
    assert_eq!(data["serial"], json!("SN-7731"));
}

#[tokio::test]
async fn firmware_first_updates_only_outdated_components() {
    let lab = new_machine_lab();
    let wf = lab
        .factory()
        .build("wf-fw", WorkflowType::FirmwareFirst, full_params());

    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Completed);

    let applied = lab.firmware.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1, settings(json!({ "BIOS": "2.19.1" })));

    let snap = wf.snapshot();
    assert_eq!(
        snap.step("firmware_update").unwrap().result,
        Some(json!({ "updated": ["BIOS"] }))
    );
    // Firmware runs before any BIOS step.
    let order: Vec<&str> = snap.steps.iter().map(|s| s.name.as_str()).collect();
    let fw = order.iter().position(|n| *n == "firmware_update").unwrap();
    let bios = order.iter().position(|n| *n == "bios_pull").unwrap();
    assert!(fw < bios);
}

#[tokio::test]
async fn ready_machine_is_not_recommissioned() {
    let lab = Lab::new(StaticCommissioning::strict().with_machine(machine("srv-1", "Ready", Some("10.20.0.5"))));
    let wf = lab.factory().build("wf-ready", WorkflowType::Standard, full_params());

    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(lab.commissioning.commission_count(), 0);
    assert_eq!(
        wf.snapshot().step("commission").unwrap().result.as_ref().unwrap()["commissioned"],
        json!(false)
    );
}

#[tokio::test]
async fn bios_only_workflow_skips_commissioning() {
    let lab = new_machine_lab();
    let wf = lab
        .factory()
        .build("wf-bios", WorkflowType::BiosConfiguration, full_params());

    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(lab.commissioning.commission_count(), 0);
    assert!(lab.bmc.applied().is_empty());
    assert_eq!(lab.bios.current("10.20.0.5")["BootMode"], json!("Uefi"));
}

#[tokio::test]
async fn explicit_target_address_is_used_when_nothing_is_discovered() {
    let lab = Lab::new(StaticCommissioning::strict().with_machine(machine("srv-1", "Ready", None)));
    let mut params = full_params();
    params.target_address = Some("10.20.0.5".to_string());

    let wf = lab.factory().build("wf-addr", WorkflowType::IpmiSetup, params);
    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(lab.bmc.current("10.20.0.5")["ip_source"], json!("static"));
}

#[tokio::test]
async fn discovery_without_any_address_fails() {
    let lab = Lab::new(StaticCommissioning::strict().with_machine(machine("srv-1", "Ready", None)));
    let wf = lab
        .factory()
        .build("wf-noaddr", WorkflowType::IpmiSetup, full_params());

    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Failed);
    let snap = wf.snapshot();
    assert_eq!(snap.failed_step.as_deref(), Some("discover"));
    assert!(snap.error.clone().unwrap().contains("No address discovered"));
    assert_eq!(snap.step("ipmi_configure").unwrap().status, StepStatus::Skipped);
}

/// BIOS client that accepts changes but never applies them.
struct StuckBios;

#[async_trait]
impl RemoteConfigClient for StuckBios {
    fn protocol(&self) -> &str {
        "stuck-bios"
    }

    async fn pull(&self, _target: &RemoteTarget) -> anyhow::Result<Settings> {
        Ok(settings(json!({ "BootMode": "Legacy" })))
    }

    async fn apply(&self, _target: &RemoteTarget, _changes: &Settings) -> anyhow::Result<()> {
        Ok(())
    }

    async fn verify(&self, _target: &RemoteTarget, expected: &Settings) -> anyhow::Result<Vec<String>> {
        Ok(expected.keys().cloned().collect())
    }
}

#[tokio::test]
async fn unverified_bios_changes_fail_the_workflow() {
    let lab = new_machine_lab();
    let mut clients = lab.collaborators();
    clients.bios = Arc::new(StuckBios);
    let factory = WorkflowFactory::new(clients).with_defaults(fast_defaults());

    let wf = factory.build("wf-stuck", WorkflowType::Standard, full_params());
    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Failed);

    let snap = wf.snapshot();
    assert_eq!(snap.failed_step.as_deref(), Some("bios_push"));
    assert!(snap.error.clone().unwrap().contains("BootMode"));
    assert_eq!(snap.step("ipmi_configure").unwrap().status, StepStatus::Skipped);
    assert_eq!(snap.step("finalize").unwrap().status, StepStatus::Skipped);

    let record = lab.servers.get_server("srv-1").await.unwrap().unwrap();
    assert_eq!(record["status"], json!("discovered"));
}

/// Commissioning service whose machines always fail commissioning.
struct BrokenCommissioning;

#[async_trait]
impl CommissioningClient for BrokenCommissioning {
    async fn get_machine(&self, machine_id: &str) -> anyhow::Result<Machine> {
        Ok(machine(machine_id, "Failed commissioning", Some("10.20.0.5")))
    }

    async fn commission(&self, _machine_id: &str, _params: &CommissionParams) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_machine_ip(&self, _machine_id: &str) -> anyhow::Result<Option<String>> {
        Ok(Some("10.20.0.5".to_string()))
    }
}

#[tokio::test]
async fn failed_commissioning_stops_the_workflow() {
    let lab = new_machine_lab();
    let mut clients = lab.collaborators();
    clients.commissioning = Arc::new(BrokenCommissioning);
    let factory = WorkflowFactory::new(clients).with_defaults(fast_defaults());

    let wf = factory.build("wf-broken", WorkflowType::Standard, full_params());
    assert_eq!(wf.run().await.unwrap(), WorkflowStatus::Failed);

    let snap = wf.snapshot();
    assert_eq!(snap.failed_step.as_deref(), Some("commission"));
    assert!(snap.error.unwrap().contains("Failed commissioning"));
    assert!(snap.steps[1..].iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test]
async fn cancellation_is_observed_while_commissioning() {
    let lab = Lab::new(
        StaticCommissioning::strict()
            .with_machine(machine("srv-1", "New", Some("10.20.0.5")))
            .with_commission_polls(u32::MAX),
    );
    let wf = Arc::new(lab.factory().build("wf-cancel", WorkflowType::Standard, full_params()));

    let waiting = Arc::new(Notify::new());
    let signal = waiting.clone();
    wf.on_progress(move |event| {
        if event.kind == ProgressKind::SubTask
            && event
                .sub_task
                .as_deref()
                .is_some_and(|s| s.starts_with("Waiting for commissioning"))
        {
            signal.notify_one();
        }
        Ok(())
    });

    let runner = wf.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    waiting.notified().await;
    wf.cancel();

    assert_eq!(handle.await.unwrap().unwrap(), WorkflowStatus::Cancelled);

    let snap = wf.snapshot();
    let commission = snap.step("commission").unwrap();
    assert_eq!(commission.status, StepStatus::Failed);
    assert_eq!(commission.error.as_deref(), Some("cancelled"));
    assert!(snap.steps[1..].iter().all(|s| s.status == StepStatus::Skipped));
    assert!(lab.servers.get_server("srv-1").await.unwrap().is_none());
}
