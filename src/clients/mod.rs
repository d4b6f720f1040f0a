//! Interfaces to the systems a provisioning workflow drives.
//!
//! Steps only talk to these traits; concrete clients are chosen when the
//! manager is built.

pub mod ipmi;
pub mod maas;
pub mod memory;
pub mod redfish;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::Settings;
use crate::storage::ServerRepository;
use crate::storage::memory_servers::MemoryServerRepository;

/// A machine as known by the commissioning service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub system_id: String,
    #[serde(default)]
    pub hostname: String,
    /// Lifecycle state name, e.g. `New`, `Commissioning`, `Ready`.
    #[serde(default)]
    pub status_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
}

impl Machine {
    pub fn is_ready(&self) -> bool {
        matches!(self.status_name.as_str(), "Ready" | "Allocated" | "Deployed")
    }

    pub fn is_failed(&self) -> bool {
        self.status_name.starts_with("Failed")
    }
}

/// Options passed to a commissioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionParams {
    pub enable_ssh: bool,
    pub skip_networking: bool,
    pub skip_storage: bool,
    pub commissioning_scripts: Vec<String>,
    pub testing_scripts: Vec<String>,
}

impl Default for CommissionParams {
    fn default() -> Self {
        Self {
            enable_ssh: true,
            skip_networking: false,
            skip_storage: false,
            commissioning_scripts: Vec::new(),
            testing_scripts: vec!["none".to_string()],
        }
    }
}

/// Commissioning service (MaaS-like).
#[async_trait]
pub trait CommissioningClient: Send + Sync {
    async fn get_machine(&self, machine_id: &str) -> Result<Machine>;

    async fn commission(&self, machine_id: &str, params: &CommissionParams) -> Result<()>;

    async fn get_machine_ip(&self, machine_id: &str) -> Result<Option<String>>;
}

/// Where a remote configuration client should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub address: String,
    pub device_type: String,
}

/// Pull / apply / verify access to one configuration surface of a server
/// (BIOS, BMC network settings, firmware inventory).
#[async_trait]
pub trait RemoteConfigClient: Send + Sync {
    /// Short protocol label used in logs, e.g. `redfish-bios`.
    fn protocol(&self) -> &str;

    /// Read the current settings.
    async fn pull(&self, target: &RemoteTarget) -> Result<Settings>;

    /// Apply the given changes.
    async fn apply(&self, target: &RemoteTarget, changes: &Settings) -> Result<()>;

    /// Return the keys whose current value differs from `expected`.
    async fn verify(&self, target: &RemoteTarget, expected: &Settings) -> Result<Vec<String>>;
}

/// The collaborators a workflow's steps may call.
#[derive(Clone)]
pub struct Collaborators {
    pub commissioning: Arc<dyn CommissioningClient>,
    pub bios: Arc<dyn RemoteConfigClient>,
    pub bmc: Arc<dyn RemoteConfigClient>,
    pub firmware: Arc<dyn RemoteConfigClient>,
    pub servers: Arc<dyn ServerRepository>,
}

impl Collaborators {
    /// Collaborators backed entirely by in-memory doubles.
    pub fn in_memory() -> Self {
        Self {
            commissioning: Arc::new(memory::StaticCommissioning::new()),
            bios: Arc::new(memory::MemoryConfigClient::new("memory-bios")),
            bmc: Arc::new(memory::MemoryConfigClient::new("memory-bmc")),
            firmware: Arc::new(memory::MemoryConfigClient::new("memory-firmware")),
            servers: Arc::new(MemoryServerRepository::new()),
        }
    }
}

/// Keys of `expected` whose value in `current` differs.
pub fn diff_keys(current: &Settings, expected: &Settings) -> Vec<String> {
    expected
        .iter()
        .filter(|(k, v)| current.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}

/// Entries of `desired` that change `current`.
pub fn diff_settings(current: &Settings, desired: &Settings) -> Settings {
    desired
        .iter()
        .filter(|(k, v)| current.get(k.as_str()) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
