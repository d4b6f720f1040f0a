//! In-memory collaborators for simulated runs and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use crate::clients::{
    CommissionParams, CommissioningClient, Machine, RemoteConfigClient, RemoteTarget, diff_keys,
};
use crate::engine::types::Settings;

struct MachineEntry {
    machine: Machine,
    /// Remaining `get_machine` calls before a commissioning machine turns ready.
    polls_left: u32,
}

/// Commissioning service held in memory.
///
/// Unknown machines are enlisted on first lookup unless built with
/// [`strict`](Self::strict). A commissioned machine reports `Commissioning`
/// for `commission_polls` lookups and then `Ready`.
pub struct StaticCommissioning {
    machines: Mutex<HashMap<String, MachineEntry>>,
    auto_enlist: bool,
    commission_polls: u32,
    commissions: AtomicUsize,
}

impl Default for StaticCommissioning {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticCommissioning {
    pub fn new() -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
            auto_enlist: true,
            commission_polls: 1,
            commissions: AtomicUsize::new(0),
        }
    }

    pub fn strict() -> Self {
        Self {
            auto_enlist: false,
            ..Self::new()
        }
    }

    pub fn with_commission_polls(mut self, polls: u32) -> Self {
        self.commission_polls = polls;
        self
    }

    pub fn with_machine(self, machine: Machine) -> Self {
        self.machines.lock().unwrap().insert(
            machine.system_id.clone(),
            MachineEntry {
                machine,
                polls_left: 0,
            },
        );
        self
    }

    /// Number of commission requests received.
    pub fn commission_count(&self) -> usize {
        self.commissions.load(Ordering::SeqCst)
    }

    fn enlist(&self, machine_id: &str, machines: &mut HashMap<String, MachineEntry>) -> Result<()> {
        if machines.contains_key(machine_id) {
            return Ok(());
        }
        if !self.auto_enlist {
            anyhow::bail!("Machine not found: {}", machine_id);
        }
        let octet = machines.len() % 250 + 2;
        machines.insert(
            machine_id.to_string(),
            MachineEntry {
                machine: Machine {
                    system_id: machine_id.to_string(),
                    hostname: machine_id.to_string(),
                    status_name: "New".to_string(),
                    serial: Some(format!("SN-{}", machine_id.to_uppercase())),
                    ip_addresses: vec![format!("10.0.0.{}", octet)],
                    power_state: Some("off".to_string()),
                },
                polls_left: 0,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CommissioningClient for StaticCommissioning {
    async fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        let mut machines = self.machines.lock().unwrap();
        self.enlist(machine_id, &mut machines)?;
        let entry = machines
            .get_mut(machine_id)
            .ok_or_else(|| anyhow::anyhow!("Machine not found: {}", machine_id))?;

        if entry.machine.status_name == "Commissioning" {
            if entry.polls_left == 0 {
                entry.machine.status_name = "Ready".to_string();
            } else {
                entry.polls_left -= 1;
            }
        }
        Ok(entry.machine.clone())
    }

    async fn commission(&self, machine_id: &str, _params: &CommissionParams) -> Result<()> {
        let mut machines = self.machines.lock().unwrap();
        self.enlist(machine_id, &mut machines)?;
        if let Some(entry) = machines.get_mut(machine_id) {
            entry.machine.status_name = "Commissioning".to_string();
            entry.machine.power_state = Some("on".to_string());
            entry.polls_left = self.commission_polls;
        }
        self.commissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_machine_ip(&self, machine_id: &str) -> Result<Option<String>> {
        let mut machines = self.machines.lock().unwrap();
        self.enlist(machine_id, &mut machines)?;
        Ok(machines
            .get(machine_id)
            .and_then(|e| e.machine.ip_addresses.first().cloned()))
    }
}

/// Configuration surface held in memory, keyed by target address.
pub struct MemoryConfigClient {
    protocol: String,
    settings: Mutex<HashMap<String, Settings>>,
    applied: Mutex<Vec<(String, Settings)>>,
}

impl MemoryConfigClient {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            settings: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(self, address: &str, settings: Settings) -> Self {
        self.settings
            .lock()
            .unwrap()
            .insert(address.to_string(), settings);
        self
    }

    /// Current settings for `address` (empty when never touched).
    pub fn current(&self, address: &str) -> Settings {
        self.settings
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Every `apply` call received, in order.
    pub fn applied(&self) -> Vec<(String, Settings)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteConfigClient for MemoryConfigClient {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn pull(&self, target: &RemoteTarget) -> Result<Settings> {
        Ok(self.current(&target.address))
    }

    async fn apply(&self, target: &RemoteTarget, changes: &Settings) -> Result<()> {
        {
            let mut settings = self.settings.lock().unwrap();
            let entry = settings.entry(target.address.clone()).or_default();
            for (k, v) in changes {
                entry.insert(k.clone(), v.clone());
            }
        }
        self.applied
            .lock()
            .unwrap()
            .push((target.address.clone(), changes.clone()));
        Ok(())
    }

    async fn verify(&self, target: &RemoteTarget, expected: &Settings) -> Result<Vec<String>> {
        Ok(diff_keys(&self.current(&target.address), expected))
    }
}
