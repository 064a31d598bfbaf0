//! Server initialization and main run loop
//!
//! Wires the event bus, process runtime, readiness verifier, workspace
//! manager and instance event bridge, then serves the HTTP API until a
//! shutdown signal arrives. Once draining starts the bridge is cancelled and
//! every instance is stopped.

use super::loader::load_config;
use crate::api::{api_router, ProxyClient};
use anyhow::{Context, Result};
use axum::{Extension, Router};
use harbor_core::{
    resolve_executable, shutdown_signal_with_controller, ConfiguredBinaryResolver,
    InstanceEventBridge, ShutdownController, WorkspaceManager,
};
use harbor_events::EventBus;
use harbor_process::{ProcessRuntime, ReadinessVerifier};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Run the server
pub async fn run() -> Result<()> {
    info!("Starting Harbor v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let binary = config.instances.default_binary();
    match resolve_executable(&binary.path) {
        Ok(path) => info!(
            binary = %path.display(),
            label = %binary.label,
            "Instance binary resolved"
        ),
        Err(e) => warn!(
            error = %e,
            "Instance binary not found; workspace creation will fail until it is installed"
        ),
    }

    let bus = EventBus::new();
    let runtime = ProcessRuntime::new(bus.clone(), config.instances.runtime_config())
        .context("Invalid instance launch settings")?;
    let verifier = ReadinessVerifier::new(config.readiness.clone())
        .context("Failed to build health probe client")?;

    let manager = Arc::new(
        WorkspaceManager::new(
            bus.clone(),
            runtime,
            verifier,
            Arc::new(ConfiguredBinaryResolver::new(binary)),
        )
        .with_environment(Arc::new(config.instances.environment.clone())),
    );

    let bridge = Arc::new(
        InstanceEventBridge::start(bus.clone(), manager.clone(), config.bridge.clone())
            .context("Failed to start instance event bridge")?,
    );

    let shutdown_controller = ShutdownController::new();
    let proxy = ProxyClient::new().context("Failed to build proxy client")?;

    let app = api_router()
        .layer(Extension(manager.clone()))
        .layer(Extension(bus))
        .layer(Extension(bridge.clone()))
        .layer(Extension(shutdown_controller.clone()))
        .layer(Extension(proxy))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    let signal = shutdown_signal_with_controller(shutdown_controller.clone());
    serve_until(listener, app, shutdown_controller, bridge, manager, signal)
        .await
        .context("HTTP server error")?;

    info!("Harbor shutdown complete");
    Ok(())
}

/// Serve `app` until `signal` resolves and every connection has closed.
///
/// Bridge streams and instances are stopped as soon as `shutdown` starts
/// draining, and again after the server returns.
pub(crate) async fn serve_until<F>(
    listener: TcpListener,
    app: Router,
    shutdown: Arc<ShutdownController>,
    bridge: Arc<InstanceEventBridge>,
    manager: Arc<WorkspaceManager>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let draining = shutdown.token();
    let stopper = {
        let bridge = Arc::clone(&bridge);
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            draining.cancelled().await;
            stop_services(&bridge, &manager).await;
        })
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await;

    stopper.abort();
    stop_services(&bridge, &manager).await;
    served
}

async fn stop_services(bridge: &InstanceEventBridge, manager: &WorkspaceManager) {
    info!("Stopping instance event streams...");
    bridge.shutdown();

    info!("Stopping workspace instances...");
    manager.shutdown_all().await;
}

#[cfg(test)]
mod tests;
