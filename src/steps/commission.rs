use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::clients::{CommissionParams, Machine};
use crate::engine::context::WorkflowContext;
use crate::engine::step::StepAction;
use crate::steps::MACHINE_KEY;

/// Commission the machine unless it is already ready, then poll its status
/// until the commissioning service reports it ready.
///
/// Polling runs until the machine is ready or failed; the step timeout bounds
/// the wait. The cancellation flag is checked before every poll.
pub struct CommissionStep {
    params: CommissionParams,
    poll_interval: Duration,
}

impl CommissionStep {
    pub fn new(params: CommissionParams, poll_interval: Duration) -> Self {
        Self { params, poll_interval }
    }
}

fn machine_value(machine: &Machine) -> Value {
    serde_json::to_value(machine).unwrap_or(Value::Null)
}

#[async_trait]
impl StepAction for CommissionStep {
    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<Option<Value>> {
        let server_id = ctx.server_id().to_string();
        let client = ctx.clients().commissioning.clone();

        ctx.report_sub_task("Looking up machine");
        let machine = client
            .get_machine(&server_id)
            .await
            .with_context(|| format!("Failed to look up machine '{}'", server_id))?;

        if machine.is_ready() {
            info!(server_id = %server_id, status = %machine.status_name, "Machine already commissioned");
            ctx.set_data(MACHINE_KEY, machine_value(&machine));
            return Ok(Some(json!({ "status": machine.status_name, "commissioned": false })));
        }

        ctx.ensure_not_cancelled()?;

        if machine.status_name != "Commissioning" {
            ctx.report_sub_task(format!("Starting commissioning (was {})", machine.status_name));
            client
                .commission(&server_id, &self.params)
                .await
                .with_context(|| format!("Failed to start commissioning of '{}'", server_id))?;
        }

        let mut polls = 0u32;
        loop {
            ctx.ensure_not_cancelled()?;
            tokio::time::sleep(self.poll_interval).await;
            ctx.ensure_not_cancelled()?;

            polls += 1;
            let machine = client.get_machine(&server_id).await?;
            ctx.report_sub_task(format!(
                "Waiting for commissioning: {} (poll {})",
                machine.status_name, polls
            ));

            if machine.is_failed() {
                bail!("Commissioning of '{}' failed: {}", server_id, machine.status_name);
            }
            if machine.is_ready() {
                info!(server_id = %server_id, polls = polls, "Machine commissioned");
                ctx.set_data(MACHINE_KEY, machine_value(&machine));
                return Ok(Some(json!({
                    "status": machine.status_name,
                    "commissioned": true,
                    "polls": polls,
                })));
            }
        }
    }
}
