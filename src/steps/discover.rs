use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::clients::Machine;
use crate::engine::context::{IP_ADDRESS_KEY, WorkflowContext};
use crate::engine::step::StepAction;
use crate::steps::{MACHINE_KEY, SERIAL_KEY};

/// Find the server's address and serial number and record them on the
/// context and in the server repository.
///
/// The commissioning service is asked for the address first; an explicit
/// target address is the fallback.
pub struct DiscoverStep;

#[async_trait]
impl StepAction for DiscoverStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let server_id = ctx.server_id().to_string();
        let clients = ctx.clients().clone();

        ctx.report_sub_task("Resolving server address");
        let discovered = clients
            .commissioning
            .get_machine_ip(&server_id)
            .await
            .with_context(|| format!("Failed to resolve address of '{}'", server_id))?;

        let Some(ip) = discovered.or_else(|| ctx.target_address().map(str::to_string)) else {
            bail!("No address discovered for server '{}'", server_id);
        };
        ctx.set_data(IP_ADDRESS_KEY, ip.clone());

        let machine: Option<Machine> = match ctx.get_data(MACHINE_KEY) {
            Some(v) => serde_json::from_value(v.clone()).ok(),
            None => {
                ctx.report_sub_task("Reading hardware inventory");
                Some(clients.commissioning.get_machine(&server_id).await?)
            }
        };
        let serial = machine.and_then(|m| m.serial);
        if let Some(ref serial) = serial {
            ctx.set_data(SERIAL_KEY, serial.clone());
        }

        let mut fields = Map::new();
        fields.insert("ip_address".to_string(), json!(ip));
        fields.insert("device_type".to_string(), json!(ctx.device_type()));
        fields.insert("status".to_string(), json!("discovered"));
        if let Some(ref serial) = serial {
            fields.insert("serial".to_string(), json!(serial));
        }
        if let Some(location) = ctx.rack_location() {
            fields.insert("rack_location".to_string(), json!(location.to_string()));
        }
        clients
            .servers
            .record_server(&server_id, &fields)
            .await
            .with_context(|| format!("Failed to record server '{}'", server_id))?;

        info!(server_id = %server_id, ip = %ip, "Server discovered");
        Ok(Some(json!({ "ip_address": ip, "serial": serial })))
    }
}
