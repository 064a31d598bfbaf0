//! API error responses
//!
//! Every failure is rendered as `{"success": false, "error": "...", "code": "..."}`
//! so clients can tell an unknown workspace from one that is not ready yet.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

/// Error surfaced by an API handler
#[derive(Debug)]
pub enum ApiError {
    /// No workspace with this id
    WorkspaceNotFound(String),
    /// Workspace exists but has no reachable instance
    UpstreamNotReady(String),
    /// Forwarding to the instance failed
    UpstreamProxyFailed(String),
    /// Create failed during launch or readiness
    WorkspaceStartFailed(String),
    /// Malformed request
    InvalidRequest(String),
    /// Server is draining and accepts no new workspaces
    ShuttingDown,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::WorkspaceNotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamNotReady(_) | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamProxyFailed(_) => StatusCode::BAD_GATEWAY,
            Self::WorkspaceStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkspaceNotFound(_) => "WORKSPACE_NOT_FOUND",
            Self::UpstreamNotReady(_) => "UPSTREAM_NOT_READY",
            Self::UpstreamProxyFailed(_) => "UPSTREAM_PROXY_FAILED",
            Self::WorkspaceStartFailed(_) => "WORKSPACE_START_FAILED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::WorkspaceNotFound(id) => format!("Workspace not found: {}", id),
            Self::UpstreamNotReady(id) => format!("Workspace {} instance is not ready", id),
            Self::UpstreamProxyFailed(reason) => format!("Failed to proxy request: {}", reason),
            Self::WorkspaceStartFailed(reason) | Self::InvalidRequest(reason) => reason.clone(),
            Self::ShuttingDown => "Server is shutting down".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl From<harbor_core::Error> for ApiError {
    fn from(err: harbor_core::Error) -> Self {
        match err {
            harbor_core::Error::NotFound(id) => Self::WorkspaceNotFound(id),
            harbor_core::Error::Launch(harbor_process::Error::InvalidFolder(path)) => {
                Self::InvalidRequest(format!("Not a directory: {}", path.display()))
            }
            other => Self::WorkspaceStartFailed(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.code(), "{}", self.message());
        }
        let body = json!({
            "success": false,
            "error": self.message(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}
