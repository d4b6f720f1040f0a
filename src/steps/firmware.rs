use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::clients::diff_settings;
use crate::engine::context::WorkflowContext;
use crate::engine::step::StepAction;
use crate::engine::types::Settings;
use crate::steps::FIRMWARE_UPDATED_KEY;

/// Update every component whose installed version differs from the
/// requested one, one component at a time.
pub struct FirmwareUpdateStep {
    versions: Settings,
}

impl FirmwareUpdateStep {
    pub fn new(versions: Settings) -> Self {
        Self { versions }
    }
}

#[async_trait]
impl StepAction for FirmwareUpdateStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        if self.versions.is_empty() {
            ctx.report_sub_task("No firmware versions requested");
            return Ok(Some(json!({ "updated": [] })));
        }

        let target = ctx.remote_target()?;
        let clients = ctx.clients().clone();

        ctx.report_sub_task("Reading firmware inventory");
        let installed = clients.firmware.pull(&target).await?;
        let outdated = diff_settings(&installed, &self.versions);
        let total = outdated.len();

        for (i, (component, version)) in outdated.iter().enumerate() {
            ctx.ensure_not_cancelled()?;
            ctx.report_sub_task(format!(
                "Updating {} to {} ({}/{})",
                component,
                version.as_str().unwrap_or_default(),
                i + 1,
                total
            ));
            let mut single = Map::new();
            single.insert(component.clone(), version.clone());
            clients.firmware.apply(&target, &single).await?;
        }

        ctx.report_sub_task("Verifying firmware versions");
        let mismatched = clients.firmware.verify(&target, &self.versions).await?;
        if !mismatched.is_empty() {
            bail!("Firmware not at requested version: {}", mismatched.join(", "));
        }

        let updated: Vec<String> = outdated.keys().cloned().collect();
        ctx.set_data(FIRMWARE_UPDATED_KEY, json!(updated));
        info!(server_id = %ctx.server_id(), updated = total, "Firmware up to date");
        Ok(Some(json!({ "updated": updated })))
    }
}
