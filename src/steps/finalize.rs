use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::engine::context::WorkflowContext;
use crate::engine::step::StepAction;

pub struct FinalizeStep;

#[async_trait]
impl StepAction for FinalizeStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let server_id = ctx.server_id().to_string();
        let servers = ctx.clients().servers.clone();

        ctx.report_sub_task("Marking server provisioned");
        servers
            .update_server_field(&server_id, "status", &json!("provisioned"))
            .await
            .with_context(|| format!("Failed to update server '{}'", server_id))?;
        servers
            .update_server_field(&server_id, "provisioned_at", &json!(chrono::Utc::now()))
            .await?;

        Ok(Some(json!({ "status": "provisioned" })))
    }
}
