//! Workspace registry endpoints

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use harbor_core::{ShutdownController, WorkspaceManager};
use harbor_events::WorkspaceDescriptor;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResponse};

/// Body of `POST /api/workspaces`
#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortResponse {
    pub port: u16,
}

/// Port of the workspace's ready instance.
///
/// Unknown ids and ids without a ready instance are distinct errors.
pub(crate) fn ready_port(manager: &WorkspaceManager, id: &str) -> Result<u16, ApiError> {
    if manager.get(id).is_none() {
        return Err(ApiError::WorkspaceNotFound(id.to_string()));
    }
    manager
        .instance_port(id)
        .ok_or_else(|| ApiError::UpstreamNotReady(id.to_string()))
}

async fn list_workspaces(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
) -> Json<ApiResponse<Vec<WorkspaceDescriptor>>> {
    Json(ApiResponse::success(manager.list()))
}

async fn create_workspace(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
    body: Result<Json<CreateWorkspaceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<WorkspaceDescriptor>>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    if request.path.trim().is_empty() {
        return Err(ApiError::InvalidRequest("path must not be empty".to_string()));
    }
    if !shutdown.is_accepting_work() {
        return Err(ApiError::ShuttingDown);
    }

    let _guard = shutdown.register_task();
    let name = request.name.filter(|n| !n.trim().is_empty());
    let workspace = manager.create(&request.path, name).await?;
    info!(workspace_id = %workspace.id, port = ?workspace.port, "Workspace ready");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(workspace))))
}

async fn get_workspace(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkspaceDescriptor>>, ApiError> {
    manager
        .get(&id)
        .map(|workspace| Json(ApiResponse::success(workspace)))
        .ok_or(ApiError::WorkspaceNotFound(id))
}

async fn delete_workspace(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn workspace_port(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PortResponse>>, ApiError> {
    let port = ready_port(&manager, &id)?;
    Ok(Json(ApiResponse::success(PortResponse { port })))
}

/// Workspace routes
pub fn workspaces_routes() -> Router {
    Router::new()
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/api/workspaces/:id",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/workspaces/:id/port", get(workspace_port))
}
