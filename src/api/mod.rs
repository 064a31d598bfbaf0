//! Web API module for Harbor
//!
//! Provides:
//! - `/health`: liveness + version
//! - `/api/workspaces`: workspace registry (list, create, get, delete, port)
//! - `/api/events`: server-sent stream of every bus event
//! - `/workspaces/:id/instance/*path`: request proxy to the workspace's instance

pub mod error;
pub mod events;
pub mod health;
pub mod proxy;
pub mod workspaces;

use axum::Router;
use serde::Serialize;

pub use error::ApiError;
pub use events::events_routes;
pub use health::health_routes;
pub use proxy::{proxy_routes, ProxyClient};
pub use workspaces::workspaces_routes;

/// Standard JSON envelope for API responses
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Create the router with every endpoint. State is supplied via `Extension` layers.
pub fn api_router() -> Router {
    Router::new()
        .merge(health_routes())
        .merge(workspaces_routes())
        .merge(events_routes())
        .merge(proxy_routes())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Response;
    use axum::{Extension, Router};
    use harbor_core::testing::fast_bridge;
    use harbor_core::{InstanceEventBridge, ShutdownController, WorkspaceManager};

    use super::{api_router, ProxyClient};

    /// Full router wired like the server, around `manager`.
    pub fn app(manager: Arc<WorkspaceManager>) -> (Router, Arc<ShutdownController>) {
        let (router, shutdown, _) = wired(manager);
        (router, shutdown)
    }

    /// Like [`app`], also handing back the bridge the router reports on.
    pub fn wired(
        manager: Arc<WorkspaceManager>,
    ) -> (Router, Arc<ShutdownController>, Arc<InstanceEventBridge>) {
        let bus = manager.bus().clone();
        let bridge = InstanceEventBridge::start(bus.clone(), manager.clone(), fast_bridge())
            .expect("bridge");
        let bridge = Arc::new(bridge);
        let shutdown = ShutdownController::new();
        let router = api_router()
            .layer(Extension(manager))
            .layer(Extension(bus))
            .layer(Extension(Arc::clone(&bridge)))
            .layer(Extension(Arc::clone(&shutdown)))
            .layer(Extension(ProxyClient::new().expect("proxy client")));
        (router, shutdown, bridge)
    }

    pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body")
            .to_vec()
    }

    pub async fn body_json(response: Response<Body>) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }
}
