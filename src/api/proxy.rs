//! Request proxy
//!
//! `ANY /workspaces/:id/instance/*path` forwards to the workspace's instance on
//! loopback. Method, headers (minus `host` and hop-by-hop), body and query are
//! passed through; the response is streamed back. The sub-path is taken from
//! the raw request URI so percent-encoding reaches the instance untouched.
//! Streamed bodies are cut off once shutdown starts draining.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path, Request};
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures::{StreamExt, TryStreamExt};
use harbor_core::{ShutdownController, WorkspaceManager};
use tracing::{debug, warn};

use super::workspaces::ready_port;
use super::ApiError;

static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client used for forwarding. Redirects are returned to the caller.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
}

impl ProxyClient {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Still-encoded remainder of `/workspaces/{id}/instance{rest}`.
fn instance_subpath(uri_path: &str) -> &str {
    let Some(rest) = uri_path.strip_prefix("/workspaces/") else {
        return "";
    };
    let after_id = rest.find('/').map_or("", |i| &rest[i..]);
    after_id.strip_prefix("/instance").unwrap_or_default()
}

fn upstream_url(port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://127.0.0.1:{}/{}", port, path.trim_start_matches('/'));
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

async fn forward(
    manager: &WorkspaceManager,
    client: &ProxyClient,
    shutdown: &ShutdownController,
    id: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let port = ready_port(manager, id)?;
    let (parts, body) = request.into_parts();
    let url = upstream_url(port, instance_subpath(parts.uri.path()), parts.uri.query());

    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let mut headers = parts.headers;
    headers.remove(header::HOST);
    strip_hop_by_hop(&mut headers);

    debug!(workspace_id = %id, method = %parts.method, url = %url, "Proxying request");
    let mut upstream = client.client.request(parts.method, &url).headers(headers);
    if has_body {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let response = upstream.send().await.map_err(|e| {
        warn!(workspace_id = %id, url = %url, error = %e, "Proxy request failed");
        ApiError::UpstreamProxyFailed(e.to_string())
    })?;

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .take_until(shutdown.token().cancelled_owned());
    let mut proxied = Response::new(Body::from_stream(stream));
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;
    Ok(proxied)
}

async fn proxy(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Extension(client): Extension<ProxyClient>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ApiError> {
    // `*path` arrives percent-decoded; the sub-path comes from the raw URI.
    let id = params.get("id").map(String::as_str).unwrap_or_default();
    forward(&manager, &client, &shutdown, id, request).await
}

/// Proxy routes
pub fn proxy_routes() -> Router {
    Router::new()
        .route("/workspaces/:id/instance", any(proxy))
        .route("/workspaces/:id/instance/", any(proxy))
        .route("/workspaces/:id/instance/*path", any(proxy))
}

#[cfg(test)]
mod tests;
