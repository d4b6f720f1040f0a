use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::clients::diff_settings;
use crate::engine::context::WorkflowContext;
use crate::engine::step::StepAction;
use crate::engine::types::Settings;
use crate::steps::{BIOS_CHANGES_KEY, BIOS_CURRENT_KEY};

/// Read the current BIOS attributes into the context.
pub struct BiosPullStep;

#[async_trait]
impl StepAction for BiosPullStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let target = ctx.remote_target()?;
        let bios = ctx.clients().bios.clone();

        ctx.report_sub_task(format!("Reading BIOS settings via {}", bios.protocol()));
        let current = bios.pull(&target).await?;
        let count = current.len();
        ctx.set_data(BIOS_CURRENT_KEY, Value::Object(current));

        Ok(Some(json!({ "attributes": count })))
    }
}

/// Work out which desired attributes differ from the pulled ones.
pub struct BiosEditStep {
    desired: Settings,
}

impl BiosEditStep {
    pub fn new(desired: Settings) -> Self {
        Self { desired }
    }
}

#[async_trait]
impl StepAction for BiosEditStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let Some(Value::Object(current)) = ctx.get_data(BIOS_CURRENT_KEY) else {
            bail!("No BIOS settings pulled for server '{}'", ctx.server_id());
        };
        let changes = diff_settings(current, &self.desired);
        let keys: Vec<String> = changes.keys().cloned().collect();

        ctx.report_sub_task(format!("{} BIOS setting(s) to change", changes.len()));
        ctx.set_data(BIOS_CHANGES_KEY, Value::Object(changes));

        Ok(Some(json!({ "changes": keys })))
    }
}

/// Apply the computed BIOS changes and verify them.
pub struct BiosPushStep;

#[async_trait]
impl StepAction for BiosPushStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let changes: Settings = ctx.get_data_or(BIOS_CHANGES_KEY, Settings::new());
        if changes.is_empty() {
            ctx.report_sub_task("BIOS already matches desired settings");
            return Ok(Some(json!({ "applied": 0 })));
        }

        let target = ctx.remote_target()?;
        let clients = ctx.clients().clone();

        ctx.report_sub_task(format!("Applying {} BIOS setting(s)", changes.len()));
        clients.bios.apply(&target, &changes).await?;

        ctx.ensure_not_cancelled()?;
        ctx.report_sub_task("Verifying BIOS settings");
        let mismatched = clients.bios.verify(&target, &changes).await?;
        if !mismatched.is_empty() {
            bail!("BIOS settings not applied: {}", mismatched.join(", "));
        }

        clients
            .servers
            .update_server_field(ctx.server_id(), "bios_configured_at", &json!(chrono::Utc::now()))
            .await?;

        info!(server_id = %ctx.server_id(), applied = changes.len(), "BIOS configured");
        Ok(Some(json!({ "applied": changes.len() })))
    }
}
