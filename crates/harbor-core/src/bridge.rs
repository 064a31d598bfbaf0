//! Instance Event Bridge
//!
//! Re-streams each running instance's own event feed onto the shared bus.
//! A stream starts on `workspace.started` and is cancelled on
//! `workspace.stopped`, `workspace.error`, or bridge shutdown. Read failures
//! and stream ends are retried after a fixed delay until cancelled.

mod feed;

pub use feed::FeedParser;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use harbor_events::{EventBus, InstanceStreamStatus, Subscription, WorkspaceEvent};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Resolves the current port of a ready instance.
pub trait InstancePortLookup: Send + Sync {
    /// Port of the instance, if it is ready.
    fn instance_port(&self, workspace_id: &str) -> Option<u16>;
}

/// Bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path of the instance's event feed
    pub feed_path: String,
    /// Delay before reconnecting after a failure or stream end
    pub reconnect_delay_ms: u64,
    /// Delay between port lookups while the instance has no port
    pub port_poll_ms: u64,
    /// Connect timeout for the feed request
    pub connect_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            feed_path: "/event".to_string(),
            reconnect_delay_ms: 1000,
            port_poll_ms: 1000,
            connect_timeout_ms: 5000,
        }
    }
}

struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
}

struct BridgeInner {
    bus: EventBus,
    lookup: Arc<dyn InstancePortLookup>,
    config: BridgeConfig,
    client: reqwest::Client,
    handle: Handle,
    streams: DashMap<String, ActiveStream>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Bridge between instance event feeds and the bus.
pub struct InstanceEventBridge {
    inner: Arc<BridgeInner>,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for InstanceEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEventBridge")
            .field("config", &self.inner.config)
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

impl InstanceEventBridge {
    /// Subscribe to lifecycle events on `bus` and start bridging.
    ///
    /// Must be called from within a tokio runtime; stream tasks are spawned
    /// on it.
    pub fn start(
        bus: EventBus,
        lookup: Arc<dyn InstancePortLookup>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| Error::Internal(e.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build feed client: {}", e)))?;

        let inner = Arc::new(BridgeInner {
            bus: bus.clone(),
            lookup,
            config,
            client,
            handle,
            streams: DashMap::new(),
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
        let subscription = bus.subscribe(move |event| {
            let Some(inner) = weak.upgrade() else { return };
            match event {
                WorkspaceEvent::WorkspaceStarted { workspace } => inner.start_stream(&workspace.id),
                WorkspaceEvent::WorkspaceStopped { workspace_id } => {
                    inner.stop_stream(workspace_id)
                }
                WorkspaceEvent::WorkspaceError { workspace } => inner.stop_stream(&workspace.id),
                _ => {}
            }
        });

        Ok(Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Number of active streams.
    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Whether a stream is active for `workspace_id`.
    pub fn is_streaming(&self, workspace_id: &str) -> bool {
        self.inner.streams.contains_key(workspace_id)
    }

    /// Stop reacting to lifecycle events and cancel every stream.
    pub fn shutdown(&self) {
        if let Some(subscription) = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            subscription.unsubscribe();
        }
        self.inner.shutdown.cancel();
        info!(streams = self.active_streams(), "Instance event bridge shut down");
    }
}

impl Drop for InstanceEventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BridgeInner {
    fn start_stream(self: &Arc<Self>, workspace_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let (generation, cancel) = match self.streams.entry(workspace_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(workspace_id = %workspace_id, "Event stream already active");
                return;
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel = self.shutdown.child_token();
                slot.insert(ActiveStream {
                    generation,
                    cancel: cancel.clone(),
                });
                (generation, cancel)
            }
        };

        debug!(workspace_id = %workspace_id, "Starting event stream");
        let inner = Arc::clone(self);
        let id = workspace_id.to_string();
        self.handle
            .spawn(async move { inner.run_stream(id, generation, cancel).await });
    }

    fn stop_stream(&self, workspace_id: &str) {
        if let Some((_, stream)) = self.streams.remove(workspace_id) {
            debug!(workspace_id = %workspace_id, "Cancelling event stream");
            stream.cancel.cancel();
        }
    }

    async fn run_stream(
        self: Arc<Self>,
        workspace_id: String,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let reconnect = Duration::from_millis(self.config.reconnect_delay_ms);
        let poll = Duration::from_millis(self.config.port_poll_ms);

        while !cancel.is_cancelled() {
            let Some(port) = self.lookup.instance_port(&workspace_id) else {
                if sleep_or_cancelled(&cancel, poll).await {
                    break;
                }
                continue;
            };

            self.publish_status(&workspace_id, InstanceStreamStatus::Connecting, None);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.consume_feed(&workspace_id, port) => outcome,
            };

            match outcome {
                Ok(()) => {
                    debug!(workspace_id = %workspace_id, port, "Event stream ended");
                    self.publish_status(
                        &workspace_id,
                        InstanceStreamStatus::Disconnected,
                        Some("stream ended".to_string()),
                    );
                }
                Err(reason) => {
                    warn!(
                        workspace_id = %workspace_id,
                        port,
                        reason = %reason,
                        "Event stream failed"
                    );
                    self.publish_status(&workspace_id, InstanceStreamStatus::Error, Some(reason));
                }
            }

            if sleep_or_cancelled(&cancel, reconnect).await {
                break;
            }
        }

        self.publish_status(&workspace_id, InstanceStreamStatus::Disconnected, None);
        self.streams
            .remove_if(&workspace_id, |_, stream| stream.generation == generation);
        debug!(workspace_id = %workspace_id, "Event stream finished");
    }

    async fn consume_feed(
        &self,
        workspace_id: &str,
        port: u16,
    ) -> std::result::Result<(), String> {
        let url = format!("http://127.0.0.1:{}{}", port, self.config.feed_path);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let mut body = response.bytes_stream();
        let mut parser = FeedParser::new();
        let mut connected = false;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            if !connected && !chunk.is_empty() {
                connected = true;
                info!(workspace_id = %workspace_id, port, "Event stream connected");
                self.publish_status(workspace_id, InstanceStreamStatus::Connected, None);
            }

            for payload in parser.push(&chunk) {
                match serde_json::from_str::<serde_json::Value>(&payload) {
                    Ok(event) => {
                        self.bus.publish(WorkspaceEvent::InstanceEvent {
                            instance_id: workspace_id.to_string(),
                            event,
                        });
                    }
                    Err(e) => {
                        debug!(
                            workspace_id = %workspace_id,
                            error = %e,
                            "Skipping undecodable feed record"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn publish_status(
        &self,
        workspace_id: &str,
        status: InstanceStreamStatus,
        reason: Option<String>,
    ) {
        self.bus.publish(WorkspaceEvent::InstanceStatus {
            instance_id: workspace_id.to_string(),
            status,
            reason,
        });
    }
}

/// Sleep for `duration`; returns true if cancelled first.
async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
