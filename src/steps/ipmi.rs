use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::clients::diff_settings;
use crate::engine::context::WorkflowContext;
use crate::engine::step::StepAction;
use crate::engine::types::Settings;
use crate::steps::BMC_APPLIED_KEY;

/// Bring the BMC network settings to the desired values.
pub struct IpmiConfigureStep {
    settings: Settings,
}

impl IpmiConfigureStep {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StepAction for IpmiConfigureStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        if self.settings.is_empty() {
            ctx.report_sub_task("No BMC settings requested");
            return Ok(Some(json!({ "applied": 0 })));
        }

        let target = ctx.remote_target()?;
        let clients = ctx.clients().clone();

        ctx.report_sub_task(format!("Reading BMC settings via {}", clients.bmc.protocol()));
        let current = clients.bmc.pull(&target).await?;
        let changes = diff_settings(&current, &self.settings);

        if !changes.is_empty() {
            ctx.ensure_not_cancelled()?;
            ctx.report_sub_task(format!("Applying {} BMC setting(s)", changes.len()));
            clients.bmc.apply(&target, &changes).await?;
        }

        ctx.report_sub_task("Verifying BMC settings");
        let mismatched = clients.bmc.verify(&target, &self.settings).await?;
        if !mismatched.is_empty() {
            bail!("BMC settings not applied: {}", mismatched.join(", "));
        }

        let applied: Vec<String> = changes.keys().cloned().collect();
        ctx.set_data(BMC_APPLIED_KEY, json!(applied));
        clients
            .servers
            .update_server_field(ctx.server_id(), "bmc_configured", &json!(true))
            .await?;

        info!(server_id = %ctx.server_id(), applied = applied.len(), "BMC configured");
        Ok(Some(json!({ "applied": applied.len() })))
    }
}
