use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clients::{CommissionParams, Collaborators};
use crate::engine::context::WorkflowContext;
use crate::engine::step::{DEFAULT_STEP_TIMEOUT, StepAction, WorkflowStep};
use crate::engine::types::{RackLocation, Settings};
use crate::engine::workflow::Workflow;
use crate::error::{Result, WorkflowError};
use crate::steps;

/// The pre-defined provisioning sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowType {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "firmware_first")]
    FirmwareFirst,
    #[serde(rename = "bios")]
    BiosConfiguration,
    #[serde(rename = "ipmi")]
    IpmiSetup,
}

impl WorkflowType {
    pub fn all() -> [WorkflowType; 4] {
        [
            WorkflowType::Standard,
            WorkflowType::FirmwareFirst,
            WorkflowType::BiosConfiguration,
            WorkflowType::IpmiSetup,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Standard => "standard",
            WorkflowType::FirmwareFirst => "firmware_first",
            WorkflowType::BiosConfiguration => "bios",
            WorkflowType::IpmiSetup => "ipmi",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WorkflowType::Standard => "Commission, discover, configure BIOS and IPMI, finalize",
            WorkflowType::FirmwareFirst => "Like standard, with firmware updates before BIOS configuration",
            WorkflowType::BiosConfiguration => "Discover and apply BIOS settings only",
            WorkflowType::IpmiSetup => "Discover and configure the BMC network only",
        }
    }

    /// The fixed step sequence of this type.
    pub fn step_kinds(&self) -> &'static [StepKind] {
        use StepKind::*;
        match self {
            WorkflowType::Standard => &[
                Commission,
                Discover,
                BiosPull,
                BiosEdit,
                BiosPush,
                IpmiConfigure,
                Finalize,
            ],
            WorkflowType::FirmwareFirst => &[
                Commission,
                Discover,
                FirmwareUpdate,
                BiosPull,
                BiosEdit,
                BiosPush,
                IpmiConfigure,
                Finalize,
            ],
            WorkflowType::BiosConfiguration => &[Discover, BiosPull, BiosEdit, BiosPush],
            WorkflowType::IpmiSetup => &[Discover, IpmiConfigure],
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(WorkflowType::Standard),
            "firmware_first" => Ok(WorkflowType::FirmwareFirst),
            "bios" => Ok(WorkflowType::BiosConfiguration),
            "ipmi" => Ok(WorkflowType::IpmiSetup),
            other => Err(WorkflowError::UnknownWorkflowType(other.to_string())),
        }
    }
}

/// Building blocks the workflow types are assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Commission,
    Discover,
    FirmwareUpdate,
    BiosPull,
    BiosEdit,
    BiosPush,
    IpmiConfigure,
    Finalize,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Commission => "commission",
            StepKind::Discover => "discover",
            StepKind::FirmwareUpdate => "firmware_update",
            StepKind::BiosPull => "bios_pull",
            StepKind::BiosEdit => "bios_edit",
            StepKind::BiosPush => "bios_push",
            StepKind::IpmiConfigure => "ipmi_configure",
            StepKind::Finalize => "finalize",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepKind::Commission => "Commission the machine and wait until it is ready",
            StepKind::Discover => "Discover the server's address and serial number",
            StepKind::FirmwareUpdate => "Update firmware components to the requested versions",
            StepKind::BiosPull => "Read the current BIOS settings",
            StepKind::BiosEdit => "Compute the BIOS changes to apply",
            StepKind::BiosPush => "Apply and verify the BIOS changes",
            StepKind::IpmiConfigure => "Configure and verify the BMC network settings",
            StepKind::Finalize => "Mark the server as provisioned",
        }
    }
}

/// Inputs of a provisioning workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningParams {
    pub server_id: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rack_location: Option<RackLocation>,
    /// Desired BIOS attributes.
    pub bios_settings: Settings,
    /// Desired BMC LAN settings (`ip_source`, `ip_address`, `netmask`, ...).
    pub bmc_settings: Settings,
    /// Desired firmware version per inventory component.
    pub firmware: Settings,
    pub commission: CommissionParams,
}

impl ProvisioningParams {
    pub fn new(server_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            device_type: device_type.into(),
            ..Default::default()
        }
    }
}

/// Timeouts and retry settings applied to the steps the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefaults {
    pub timeout: Duration,
    pub commission_timeout: Duration,
    pub firmware_timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Interval between machine status polls while commissioning.
    pub poll_interval: Duration,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STEP_TIMEOUT,
            commission_timeout: Duration::from_secs(3600),
            firmware_timeout: Duration::from_secs(1800),
            retries: 2,
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Assembles workflows from a [`WorkflowType`] and [`ProvisioningParams`].
///
/// The factory never executes anything; it only binds steps to a fresh
/// context that shares the factory's collaborators.
#[derive(Clone)]
pub struct WorkflowFactory {
    clients: Collaborators,
    defaults: StepDefaults,
}

impl WorkflowFactory {
    pub fn new(clients: Collaborators) -> Self {
        Self {
            clients,
            defaults: StepDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: StepDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn clients(&self) -> &Collaborators {
        &self.clients
    }

    pub fn defaults(&self) -> StepDefaults {
        self.defaults
    }

    pub fn build(&self, id: &str, workflow_type: WorkflowType, params: ProvisioningParams) -> Workflow {
        let steps = self.steps_for(workflow_type, &params);

        let mut ctx = WorkflowContext::new(params.server_id, params.device_type, self.clients.clone());
        if let Some(address) = params.target_address {
            ctx = ctx.with_target_address(address);
        }
        if let Some(location) = params.rack_location {
            ctx = ctx.with_rack_location(location);
        }

        Workflow::new(id, workflow_type.as_str(), ctx, steps)
    }

    pub fn build_by_name(&self, id: &str, type_name: &str, params: ProvisioningParams) -> Result<Workflow> {
        let workflow_type: WorkflowType = type_name.parse()?;
        Ok(self.build(id, workflow_type, params))
    }

    /// Step names and descriptions of a workflow type, in execution order.
    pub fn describe(workflow_type: WorkflowType) -> Vec<(&'static str, &'static str)> {
        workflow_type
            .step_kinds()
            .iter()
            .map(|k| (k.name(), k.description()))
            .collect()
    }

    pub fn steps_for(&self, workflow_type: WorkflowType, params: &ProvisioningParams) -> Vec<WorkflowStep> {
        workflow_type
            .step_kinds()
            .iter()
            .map(|kind| self.step(*kind, params))
            .collect()
    }

    fn step(&self, kind: StepKind, params: &ProvisioningParams) -> WorkflowStep {
        let d = self.defaults;
        let action: Arc<dyn StepAction> = match kind {
            StepKind::Commission => Arc::new(steps::CommissionStep::new(
                params.commission.clone(),
                d.poll_interval,
            )),
            StepKind::Discover => Arc::new(steps::DiscoverStep),
            StepKind::FirmwareUpdate => Arc::new(steps::FirmwareUpdateStep::new(params.firmware.clone())),
            StepKind::BiosPull => Arc::new(steps::BiosPullStep),
            StepKind::BiosEdit => Arc::new(steps::BiosEditStep::new(params.bios_settings.clone())),
            StepKind::BiosPush => Arc::new(steps::BiosPushStep),
            StepKind::IpmiConfigure => Arc::new(steps::IpmiConfigureStep::new(params.bmc_settings.clone())),
            StepKind::Finalize => Arc::new(steps::FinalizeStep),
        };
        let timeout = match kind {
            StepKind::Commission => d.commission_timeout,
            StepKind::FirmwareUpdate => d.firmware_timeout,
            _ => d.timeout,
        };

        WorkflowStep::from_arc(kind.name(), kind.description(), action)
            .with_timeout(timeout)
            .with_retry(d.retries, d.retry_delay)
    }
}
