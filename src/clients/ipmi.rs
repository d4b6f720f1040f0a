use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::clients::{RemoteConfigClient, RemoteTarget, diff_keys};
use crate::engine::types::Settings;

/// BMC LAN settings understood by [`IpmiToolClient`], in the order they are applied.
pub const LAN_KEYS: [&str; 5] = ["ip_source", "ip_address", "netmask", "gateway", "vlan"];

#[derive(Debug, Clone)]
pub struct IpmiOptions {
    pub username: String,
    pub password: String,
    pub channel: u8,
    /// ipmitool interface, `lanplus` for IPMI 2.0.
    pub interface: String,
    pub binary: String,
    pub timeout: Duration,
}

impl Default for IpmiOptions {
    fn default() -> Self {
        Self {
            username: "ADMIN".to_string(),
            password: String::new(),
            channel: 1,
            interface: "lanplus".to_string(),
            binary: "ipmitool".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// BMC network configuration through the `ipmitool` CLI.
pub struct IpmiToolClient {
    options: IpmiOptions,
}

impl IpmiToolClient {
    pub fn new(options: IpmiOptions) -> Self {
        Self { options }
    }

    async fn run(&self, target: &RemoteTarget, args: &[String]) -> Result<String> {
        let mut command = tokio::process::Command::new(&self.options.binary);
        command
            .arg("-I")
            .arg(&self.options.interface)
            .arg("-H")
            .arg(&target.address)
            .arg("-U")
            .arg(&self.options.username)
            .arg("-E")
            .env("IPMI_PASSWORD", &self.options.password)
            .args(args)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        debug!(address = %target.address, args = ?args, "ipmitool");

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.options.binary))?;

        let output = match tokio::time::timeout(self.options.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => bail!(
                "ipmitool timed out after {}s against {}",
                self.options.timeout.as_secs(),
                target.address
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "ipmitool {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Parse `ipmitool lan print` output into LAN settings.
pub fn parse_lan_print(output: &str) -> Settings {
    let mut settings = Settings::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let key = match key.trim() {
            "IP Address Source" => {
                let source = if value.to_ascii_lowercase().contains("dhcp") {
                    "dhcp"
                } else {
                    "static"
                };
                settings.insert("ip_source".to_string(), Value::from(source));
                continue;
            }
            "IP Address" => "ip_address",
            "Subnet Mask" => "netmask",
            "Default Gateway IP" => "gateway",
            "802.1q VLAN ID" => {
                let vlan = if value.eq_ignore_ascii_case("disabled") {
                    Value::from("off")
                } else {
                    value.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(value))
                };
                settings.insert("vlan".to_string(), vlan);
                continue;
            }
            _ => continue,
        };
        settings.insert(key.to_string(), Value::from(value));
    }
    settings
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `lan set` argument lists for the given changes, in application order.
pub fn lan_set_commands(channel: u8, changes: &Settings) -> Result<Vec<Vec<String>>> {
    for key in changes.keys() {
        if !LAN_KEYS.contains(&key.as_str()) {
            bail!("Unsupported BMC setting '{}' (supported: {})", key, LAN_KEYS.join(", "));
        }
    }

    let channel = channel.to_string();
    let mut commands = Vec::new();
    for key in LAN_KEYS {
        let Some(value) = changes.get(key) else {
            continue;
        };
        let value = value_text(value);
        let tail: Vec<String> = match key {
            "ip_source" => vec!["ipsrc".into(), value],
            "ip_address" => vec!["ipaddr".into(), value],
            "netmask" => vec!["netmask".into(), value],
            "gateway" => vec!["defgw".into(), "ipaddr".into(), value],
            "vlan" => vec!["vlan".into(), "id".into(), value],
            _ => continue,
        };
        let mut args = vec!["lan".to_string(), "set".to_string(), channel.clone()];
        args.extend(tail);
        commands.push(args);
    }
    Ok(commands)
}

#[async_trait]
impl RemoteConfigClient for IpmiToolClient {
    fn protocol(&self) -> &str {
        "ipmi"
    }

    async fn pull(&self, target: &RemoteTarget) -> Result<Settings> {
        let args = vec![
            "lan".to_string(),
            "print".to_string(),
            self.options.channel.to_string(),
        ];
        let output = self.run(target, &args).await?;
        Ok(parse_lan_print(&output))
    }

    async fn apply(&self, target: &RemoteTarget, changes: &Settings) -> Result<()> {
        for args in lan_set_commands(self.options.channel, changes)? {
            self.run(target, &args).await?;
        }
        Ok(())
    }

    async fn verify(&self, target: &RemoteTarget, expected: &Settings) -> Result<Vec<String>> {
        let current = self.pull(target).await?;
        let expected: Settings = expected
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(value_text(v))))
            .collect();
        let current: Settings = current
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(value_text(v))))
            .collect();
        Ok(diff_keys(&current, &expected))
    }
}
