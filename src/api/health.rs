//! Health check endpoints.
//!
//! Provides:
//! - `/health`: simple "healthy" + version (for load balancers)
//! - `/health/detailed`: registry, runtime and bridge counters

use std::sync::Arc;

use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use harbor_core::{InstanceEventBridge, ShutdownController, WorkspaceManager};
use harbor_events::WorkspaceStatus;
use serde::Serialize;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed health response
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub phase: String,
    pub workspaces: WorkspaceCounts,
    pub active_processes: usize,
    pub active_streams: usize,
    pub event_subscribers: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct WorkspaceCounts {
    pub total: usize,
    pub starting: usize,
    pub ready: usize,
    pub error: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn detailed_health_check(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Extension(bridge): Extension<Arc<InstanceEventBridge>>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
) -> Json<DetailedHealthResponse> {
    let mut counts = WorkspaceCounts::default();
    for workspace in manager.list() {
        counts.total += 1;
        match workspace.status {
            WorkspaceStatus::Starting => counts.starting += 1,
            WorkspaceStatus::Ready => counts.ready += 1,
            WorkspaceStatus::Error => counts.error += 1,
            WorkspaceStatus::Stopped => {}
        }
    }

    let status = if !shutdown.is_accepting_work() {
        "shutting_down"
    } else if counts.error > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(DetailedHealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        phase: shutdown.phase().to_string(),
        workspaces: counts,
        active_processes: manager.runtime().active_processes(),
        active_streams: bridge.active_streams(),
        event_subscribers: manager.bus().subscriber_count(),
    })
}

/// Health routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
}
