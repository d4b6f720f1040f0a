use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::engine::factory::{ProvisioningParams, WorkflowFactory, WorkflowType};
use crate::engine::types::{WorkflowSnapshot, WorkflowStatus};
use crate::engine::workflow::CancelOutcome;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    /// Workflow id; a random UUID when omitted.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_workflow_type")]
    pub workflow_type: String,
    /// Start the workflow right away (default: true).
    #[serde(default = "default_start")]
    pub start: bool,
    #[serde(flatten)]
    pub params: ProvisioningParams,
}

fn default_workflow_type() -> String {
    WorkflowType::Standard.as_str().to_string()
}

fn default_start() -> bool {
    true
}

#[derive(Serialize)]
pub struct CreateWorkflowResponse {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub steps: Vec<String>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub id: String,
    #[serde(flatten)]
    pub outcome: CancelOutcome,
}

#[derive(Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub workflow_type: String,
    pub server_id: String,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub total_steps: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&WorkflowSnapshot> for WorkflowSummary {
    fn from(s: &WorkflowSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            workflow_type: s.workflow_type.clone(),
            server_id: s.server_id.clone(),
            status: s.status,
            current_step: s.current_step.clone(),
            total_steps: s.total_steps(),
            created_at: s.created_at,
            started_at: s.started_at,
            ended_at: s.ended_at,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /workflow-types
pub async fn list_types() -> Json<serde_json::Value> {
    let types: Vec<serde_json::Value> = WorkflowType::all()
        .iter()
        .map(|t| {
            let steps: Vec<serde_json::Value> = WorkflowFactory::describe(*t)
                .into_iter()
                .map(|(name, description)| serde_json::json!({ "name": name, "description": description }))
                .collect();
            serde_json::json!({
                "name": t.as_str(),
                "description": t.description(),
                "steps": steps,
            })
        })
        .collect();

    let total = types.len();
    Json(serde_json::json!({
        "types": types,
        "total": total,
    }))
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListWorkflowsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status_filter = params
        .status
        .as_deref()
        .map(|s| {
            WorkflowStatus::parse(s).ok_or_else(|| {
                AppError::BadRequest(format!(
                    "Invalid status '{}'. Use: pending, running, completed, failed, cancelled",
                    s
                ))
            })
        })
        .transpose()?;

    let summaries: Vec<WorkflowSummary> = state
        .manager
        .list_snapshots()
        .await
        .iter()
        .filter(|s| status_filter.is_none_or(|f| s.status == f))
        .map(WorkflowSummary::from)
        .collect();

    let total = summaries.len();
    Ok(Json(serde_json::json!({
        "workflows": summaries,
        "total": total,
    })))
}

/// GET /workflows/active
pub async fn active_workflows(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let summaries: Vec<WorkflowSummary> = state
        .manager
        .get_active_workflows()
        .await
        .iter()
        .map(|w| WorkflowSummary::from(&w.snapshot()))
        .collect();

    let total = summaries.len();
    Json(serde_json::json!({
        "workflows": summaries,
        "total": total,
    }))
}

/// POST /workflows
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<CreateWorkflowResponse>), AppError> {
    if req.params.server_id.trim().is_empty() {
        return Err(AppError::BadRequest("'server_id' is required".to_string()));
    }

    let id = req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let workflow = state
        .manager
        .create_workflow_by_name(&id, &req.workflow_type, req.params)
        .await?;

    if req.start {
        // The run continues on its own task; its outcome is read back through the API.
        state.manager.start_workflow(&id).await?;
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateWorkflowResponse {
            id,
            workflow_type: workflow.workflow_type().to_string(),
            status: workflow.status(),
            steps: workflow.step_names().iter().map(|s| s.to_string()).collect(),
        }),
    ))
}

/// GET /workflows/{id}
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowSnapshot>, AppError> {
    state
        .manager
        .get_snapshot(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", id)))
}

/// POST /workflows/{id}/cancel
pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let outcome = state.manager.cancel_workflow(&id).await?;
    Ok(Json(CancelResponse { id, outcome }))
}

/// DELETE /workflows/{id}
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.manager.remove_workflow(&id).await?;

    Ok(Json(serde_json::json!({
        "deleted": id,
    })))
}

/// GET /workflows/events
pub async fn workflow_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();

    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(progress) => match Event::default().event("progress").json_data(&progress) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => warn!(error = %e, "Failed to encode progress event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event stream lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
