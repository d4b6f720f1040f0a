mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::WorkflowManager;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub manager: Arc<WorkflowManager>,
}

/// Build the API router around a manager.
pub fn router(manager: Arc<WorkflowManager>, max_body: usize) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/health", get(handlers::health))
        .route("/workflow-types", get(handlers::list_types))
        .route(
            "/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/workflows/active", get(handlers::active_workflows))
        .route("/workflows/events", get(handlers::workflow_events))
        .route(
            "/workflows/{id}",
            get(handlers::get_workflow).delete(handlers::delete_workflow),
        )
        .route("/workflows/{id}/cancel", post(handlers::cancel_workflow))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, manager: Arc<WorkflowManager>, max_body: usize) -> Result<()> {
    let app = router(manager, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("rackflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
