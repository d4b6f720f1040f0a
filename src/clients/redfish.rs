//! Redfish clients for BIOS attributes and firmware inventory.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::clients::{RemoteConfigClient, RemoteTarget, diff_keys};
use crate::engine::types::Settings;

/// Connection settings shared by the Redfish clients.
#[derive(Debug, Clone)]
pub struct RedfishOptions {
    pub username: String,
    pub password: String,
    /// Explicit system id; the first member of `/redfish/v1/Systems` otherwise.
    pub system_id: Option<String>,
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

impl Default for RedfishOptions {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: String::new(),
            system_id: None,
            accept_invalid_certs: true,
            timeout: Duration::from_secs(30),
        }
    }
}

struct RedfishHttp {
    http: reqwest::Client,
    options: RedfishOptions,
}

impl RedfishHttp {
    fn new(options: RedfishOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .context("Failed to build Redfish HTTP client")?;
        Ok(Self { http, options })
    }

    fn base_url(target: &RemoteTarget) -> String {
        if target.address.starts_with("http://") || target.address.starts_with("https://") {
            target.address.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", target.address)
        }
    }

    async fn get(&self, target: &RemoteTarget, path: &str) -> Result<Value> {
        let url = format!("{}{}", Self::base_url(target), path);
        debug!(url = %url, "Redfish GET");
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.options.username, Some(&self.options.password))
            .send()
            .await
            .with_context(|| format!("Redfish request failed: GET {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Redfish GET {} returned {}: {}", url, status, body);
        }
        resp.json()
            .await
            .with_context(|| format!("Invalid Redfish response from {}", url))
    }

    async fn send(&self, method: reqwest::Method, target: &RemoteTarget, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{}", Self::base_url(target), path);
        debug!(url = %url, method = %method, "Redfish request");
        let resp = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.options.username, Some(&self.options.password))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Redfish request failed: {} {}", method, url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Redfish {} {} returned {}: {}", method, url, status, body);
        }
        Ok(())
    }

    /// Path of the computer system resource, e.g. `/redfish/v1/Systems/1`.
    async fn system_path(&self, target: &RemoteTarget) -> Result<String> {
        if let Some(ref id) = self.options.system_id {
            return Ok(format!("/redfish/v1/Systems/{}", id));
        }
        let systems = self.get(target, "/redfish/v1/Systems").await?;
        member_paths(&systems)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No computer systems exposed at {}", target.address))
    }
}

/// `@odata.id` of every entry in a collection's `Members`.
fn member_paths(collection: &Value) -> Vec<String> {
    collection
        .get("Members")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("@odata.id").and_then(|v| v.as_str()))
                .map(|s| s.trim_end_matches('/').to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn attributes(resource: &Value) -> Settings {
    resource
        .get("Attributes")
        .and_then(|a| a.as_object())
        .cloned()
        .unwrap_or_default()
}

/// BIOS attributes through `Systems/{id}/Bios`.
///
/// Changes are staged on `Bios/Settings` and take effect on the next reboot;
/// verification therefore checks current values overlaid with staged ones.
pub struct RedfishBiosClient {
    inner: RedfishHttp,
}

impl RedfishBiosClient {
    pub fn new(options: RedfishOptions) -> Result<Self> {
        Ok(Self {
            inner: RedfishHttp::new(options)?,
        })
    }
}

#[async_trait]
impl RemoteConfigClient for RedfishBiosClient {
    fn protocol(&self) -> &str {
        "redfish-bios"
    }

    async fn pull(&self, target: &RemoteTarget) -> Result<Settings> {
        let system = self.inner.system_path(target).await?;
        let bios = self.inner.get(target, &format!("{}/Bios", system)).await?;
        Ok(attributes(&bios))
    }

    async fn apply(&self, target: &RemoteTarget, changes: &Settings) -> Result<()> {
        let system = self.inner.system_path(target).await?;
        self.inner
            .send(
                reqwest::Method::PATCH,
                target,
                &format!("{}/Bios/Settings", system),
                &json!({ "Attributes": changes }),
            )
            .await
    }

    async fn verify(&self, target: &RemoteTarget, expected: &Settings) -> Result<Vec<String>> {
        let system = self.inner.system_path(target).await?;
        let mut effective = attributes(&self.inner.get(target, &format!("{}/Bios", system)).await?);
        let pending = self
            .inner
            .get(target, &format!("{}/Bios/Settings", system))
            .await?;
        effective.extend(attributes(&pending));
        Ok(diff_keys(&effective, expected))
    }
}

/// Firmware inventory and `SimpleUpdate` through `UpdateService`.
///
/// Settings map inventory id to version, both when pulled and when applied.
/// Image locations come from a URL template with `{component}` and
/// `{version}` placeholders.
pub struct RedfishFirmwareClient {
    inner: RedfishHttp,
    image_url_template: String,
}

impl RedfishFirmwareClient {
    pub fn new(options: RedfishOptions, image_url_template: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: RedfishHttp::new(options)?,
            image_url_template: image_url_template.into(),
        })
    }

    pub fn image_uri(&self, component: &str, version: &str) -> String {
        self.image_url_template
            .replace("{component}", component)
            .replace("{version}", version)
    }
}

const FIRMWARE_INVENTORY: &str = "/redfish/v1/UpdateService/FirmwareInventory";

#[async_trait]
impl RemoteConfigClient for RedfishFirmwareClient {
    fn protocol(&self) -> &str {
        "redfish-firmware"
    }

    async fn pull(&self, target: &RemoteTarget) -> Result<Settings> {
        let inventory = self.inner.get(target, FIRMWARE_INVENTORY).await?;
        let mut versions = Settings::new();
        for path in member_paths(&inventory) {
            let item = self.inner.get(target, &path).await?;
            let id = item
                .get("Id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| path.rsplit('/').next().unwrap_or_default().to_string());
            if let Some(version) = item.get("Version").cloned() {
                versions.insert(id, version);
            }
        }
        Ok(versions)
    }

    async fn apply(&self, target: &RemoteTarget, changes: &Settings) -> Result<()> {
        for (component, version) in changes {
            let version = version
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Firmware version for '{}' must be a string", component))?;
            let image_uri = self.image_uri(component, version);
            self.inner
                .send(
                    reqwest::Method::POST,
                    target,
                    "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate",
                    &json!({
                        "ImageURI": image_uri,
                        "Targets": [format!("{}/{}", FIRMWARE_INVENTORY, component)],
                    }),
                )
                .await
                .with_context(|| format!("Firmware update of '{}' to {} failed", component, version))?;
        }
        Ok(())
    }

    async fn verify(&self, target: &RemoteTarget, expected: &Settings) -> Result<Vec<String>> {
        let current = self.pull(target).await?;
        Ok(diff_keys(&current, expected))
    }
}
