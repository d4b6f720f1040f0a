use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::clients::Collaborators;
use crate::clients::ipmi::{IpmiOptions, IpmiToolClient};
use crate::clients::maas::MaasClient;
use crate::clients::redfish::{RedfishBiosClient, RedfishFirmwareClient, RedfishOptions};
use crate::engine::factory::StepDefaults;
use crate::storage::sql_servers::SqlServerRepository;

/// Configuration loaded from `rackflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RackflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    /// Server repository database, e.g. `sqlite://rackflow.db?mode=rwc`.
    pub database_url: Option<String>,
    pub max_concurrent_workflows: Option<usize>,
    pub maas: Option<MaasConfig>,
    pub redfish: Option<RedfishConfig>,
    pub ipmi: Option<IpmiConfig>,
    pub steps: StepConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MaasConfig {
    pub url: String,
    /// `consumer:token:secret`; `MAAS_API_KEY` when omitted.
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RedfishConfig {
    pub username: Option<String>,
    /// `REDFISH_PASSWORD` when omitted.
    pub password: Option<String>,
    pub system_id: Option<String>,
    pub accept_invalid_certs: Option<bool>,
    pub timeout_secs: Option<u64>,
    /// Firmware image location with `{component}` and `{version}` placeholders.
    pub firmware_image_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct IpmiConfig {
    pub username: Option<String>,
    /// `IPMI_PASSWORD` when omitted.
    pub password: Option<String>,
    pub channel: Option<u8>,
    pub interface: Option<String>,
    pub binary: Option<String>,
}

/// Step timeouts and retries, in seconds.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StepConfig {
    pub timeout_secs: Option<u64>,
    pub commission_timeout_secs: Option<u64>,
    pub firmware_timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_secs: Option<f64>,
    pub poll_interval_secs: Option<f64>,
}

impl StepConfig {
    pub fn to_defaults(&self) -> StepDefaults {
        let base = StepDefaults::default();
        StepDefaults {
            timeout: self.timeout_secs.map(Duration::from_secs).unwrap_or(base.timeout),
            commission_timeout: self
                .commission_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.commission_timeout),
            firmware_timeout: self
                .firmware_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.firmware_timeout),
            retries: self.retries.unwrap_or(base.retries),
            retry_delay: self
                .retry_delay_secs
                .map(Duration::from_secs_f64)
                .unwrap_or(base.retry_delay),
            poll_interval: self
                .poll_interval_secs
                .map(Duration::from_secs_f64)
                .unwrap_or(base.poll_interval),
        }
    }
}

impl RackflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `rackflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("rackflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(serde_yml::from_str(contents)?)
    }

    pub fn max_concurrent_workflows(&self) -> usize {
        self.max_concurrent_workflows
            .filter(|n| *n > 0)
            .unwrap_or_else(num_cpus::get)
    }

    pub fn step_defaults(&self) -> StepDefaults {
        self.steps.to_defaults()
    }

    /// Build the collaborators workflows talk to.
    ///
    /// With `simulate`, or for any section missing from the config, the
    /// in-memory doubles are used.
    pub async fn collaborators(&self, simulate: bool) -> Result<Collaborators> {
        let mut clients = Collaborators::in_memory();
        if simulate {
            info!("Using simulated collaborators");
            return Ok(clients);
        }

        match self.maas {
            Some(ref maas) => {
                let api_key = maas
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("MAAS_API_KEY").ok())
                    .ok_or_else(|| anyhow::anyhow!("MaaS API key missing (config maas.api_key or MAAS_API_KEY)"))?;
                clients.commissioning = Arc::new(MaasClient::new(&maas.url, &api_key)?);
            }
            None => warn!("No MaaS configured, commissioning is simulated"),
        }

        match self.redfish {
            Some(ref redfish) => {
                let defaults = RedfishOptions::default();
                let options = RedfishOptions {
                    username: redfish.username.clone().unwrap_or(defaults.username),
                    password: redfish
                        .password
                        .clone()
                        .or_else(|| std::env::var("REDFISH_PASSWORD").ok())
                        .unwrap_or_default(),
                    system_id: redfish.system_id.clone(),
                    accept_invalid_certs: redfish
                        .accept_invalid_certs
                        .unwrap_or(defaults.accept_invalid_certs),
                    timeout: redfish
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.timeout),
                };
                clients.bios = Arc::new(RedfishBiosClient::new(options.clone())?);
                match redfish.firmware_image_url {
                    Some(ref template) => {
                        clients.firmware = Arc::new(RedfishFirmwareClient::new(options, template.clone())?);
                    }
                    None => warn!("No redfish.firmware_image_url configured, firmware updates are simulated"),
                }
            }
            None => warn!("No Redfish configured, BIOS and firmware are simulated"),
        }

        match self.ipmi {
            Some(ref ipmi) => {
                let defaults = IpmiOptions::default();
                clients.bmc = Arc::new(IpmiToolClient::new(IpmiOptions {
                    username: ipmi.username.clone().unwrap_or(defaults.username),
                    password: ipmi
                        .password
                        .clone()
                        .or_else(|| std::env::var("IPMI_PASSWORD").ok())
                        .unwrap_or_default(),
                    channel: ipmi.channel.unwrap_or(defaults.channel),
                    interface: ipmi.interface.clone().unwrap_or(defaults.interface),
                    binary: ipmi.binary.clone().unwrap_or(defaults.binary),
                    timeout: defaults.timeout,
                }));
            }
            None => warn!("No IPMI configured, BMC configuration is simulated"),
        }

        if let Some(ref url) = self.database_url {
            clients.servers = Arc::new(SqlServerRepository::connect(url).await?);
        }

        Ok(clients)
    }
}
