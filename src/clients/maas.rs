use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::clients::{CommissionParams, CommissioningClient, Machine};

/// MaaS API key split into its OAuth parts (`consumer:token:secret`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaasApiKey {
    pub consumer_key: String,
    pub token_key: String,
    pub token_secret: String,
}

impl MaasApiKey {
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.trim().split(':').collect();
        match parts.as_slice() {
            [consumer, token, secret] if !consumer.is_empty() && !token.is_empty() => Ok(Self {
                consumer_key: consumer.to_string(),
                token_key: token.to_string(),
                token_secret: secret.to_string(),
            }),
            _ => bail!("MaaS API key must have the form 'consumer:token:secret'"),
        }
    }

    /// OAuth 1.0 PLAINTEXT authorization header value.
    pub fn authorization(&self, nonce: &str, timestamp: i64) -> String {
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{}\", oauth_timestamp=\"{}\"",
            self.consumer_key, self.token_key, self.token_secret, nonce, timestamp
        )
    }
}

#[derive(Debug, Deserialize, Default)]
struct HardwareInfo {
    #[serde(default)]
    system_serial: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MaasMachine {
    system_id: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    status_name: String,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    hardware_info: HardwareInfo,
}

impl From<MaasMachine> for Machine {
    fn from(m: MaasMachine) -> Self {
        Machine {
            system_id: m.system_id,
            hostname: m.hostname,
            status_name: m.status_name,
            serial: m.hardware_info.system_serial.filter(|s| !s.is_empty()),
            ip_addresses: m.ip_addresses,
            power_state: m.power_state,
        }
    }
}

/// Client for the MaaS 2.0 REST API.
pub struct MaasClient {
    http: reqwest::Client,
    base_url: String,
    api_key: MaasApiKey,
}

impl MaasClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build MaaS HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: MaasApiKey::parse(api_key)?,
        })
    }

    fn machine_url(&self, machine_id: &str) -> String {
        format!("{}/api/2.0/machines/{}/", self.base_url, machine_id)
    }

    fn auth_header(&self) -> Result<HeaderValue> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let value = self
            .api_key
            .authorization(&nonce, chrono::Utc::now().timestamp());
        HeaderValue::from_str(&value).context("Invalid MaaS authorization header")
    }
}

/// Percent-encode a form value.
fn percent_encode(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

fn commission_form(params: &CommissionParams) -> String {
    let flag = |b: bool| if b { "1" } else { "0" };
    let mut pairs = vec![
        format!("enable_ssh={}", flag(params.enable_ssh)),
        format!("skip_networking={}", flag(params.skip_networking)),
        format!("skip_storage={}", flag(params.skip_storage)),
    ];
    if !params.commissioning_scripts.is_empty() {
        pairs.push(format!(
            "commissioning_scripts={}",
            percent_encode(&params.commissioning_scripts.join(","))
        ));
    }
    if !params.testing_scripts.is_empty() {
        pairs.push(format!(
            "testing_scripts={}",
            percent_encode(&params.testing_scripts.join(","))
        ));
    }
    pairs.join("&")
}

#[async_trait]
impl CommissioningClient for MaasClient {
    async fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        let url = self.machine_url(machine_id);
        debug!(url = %url, "MaaS get machine");

        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.auth_header()?)
            .send()
            .await
            .with_context(|| format!("MaaS request failed: GET {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("MaaS returned {} for machine '{}': {}", status, machine_id, body);
        }

        let machine: MaasMachine = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse MaaS machine '{}'", machine_id))?;
        Ok(machine.into())
    }

    async fn commission(&self, machine_id: &str, params: &CommissionParams) -> Result<()> {
        let url = format!("{}?op=commission", self.machine_url(machine_id));
        debug!(url = %url, "MaaS commission");

        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.auth_header()?)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(commission_form(params))
            .send()
            .await
            .with_context(|| format!("MaaS request failed: POST {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("MaaS refused to commission '{}' ({}): {}", machine_id, status, body);
        }
        Ok(())
    }

    async fn get_machine_ip(&self, machine_id: &str) -> Result<Option<String>> {
        let machine = self.get_machine(machine_id).await?;
        Ok(machine.ip_addresses.into_iter().next())
    }
}
