//! Test fixtures
//!
//! - [`FakeInstance`]: shell script that behaves like an instance binary
//!   (announces a port, fails, or exits later).
//! - [`FakeUpstream`]: loopback HTTP server standing in for the instance's
//!   own API: health endpoint, event feed, and an echo route for everything
//!   else. It can go offline and come back on the same port.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harbor_events::{EventBus, EventStream, WorkspaceEvent};
use harbor_process::{ProcessRuntime, ReadinessConfig, ReadinessVerifier, RuntimeConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeConfig;
use crate::collaborators::{ConfiguredBinaryResolver, ResolvedBinary};
use crate::orchestrator::WorkspaceManager;

/// Scripted stand-in for the instance executable, run as `/bin/sh <script>`.
pub struct FakeInstance {
    _dir: TempDir,
    script: PathBuf,
}

impl FakeInstance {
    /// Run `body` as the instance.
    pub fn from_script(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create script dir");
        let script = dir.path().join("instance.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        Self { _dir: dir, script }
    }

    /// Announce `port` and stay alive.
    pub fn serving(port: u16) -> Self {
        Self::from_script(&format!("echo booting\n{}\nexec sleep 300", announce(port)))
    }

    /// Write `stderr` and exit with `code` without announcing a port.
    pub fn failing(stderr: &str, code: i32) -> Self {
        Self::from_script(&format!("echo '{}' >&2\nexit {}", stderr, code))
    }

    /// Announce `port`, then exit with `code` after `delay_ms`.
    pub fn exiting_after(port: u16, delay_ms: u64, code: i32) -> Self {
        let seconds = delay_ms as f64 / 1000.0;
        Self::from_script(&format!("{}\nsleep {:.3}\nexit {}", announce(port), seconds, code))
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            args: vec![self.script.display().to_string()],
            stop_grace_ms: 500,
            ..Default::default()
        }
    }

    pub fn binary(&self) -> ResolvedBinary {
        ResolvedBinary {
            path: PathBuf::from("/bin/sh"),
            label: "Fake Instance".to_string(),
            version: Some("0.0.0-test".to_string()),
        }
    }

    /// Manager wired to this instance with short readiness timings.
    pub fn manager(&self, bus: EventBus) -> WorkspaceManager {
        let runtime = ProcessRuntime::new(bus.clone(), self.runtime_config()).expect("runtime");
        let verifier = ReadinessVerifier::new(fast_readiness()).expect("verifier");
        WorkspaceManager::new(
            bus,
            runtime,
            verifier,
            Arc::new(ConfiguredBinaryResolver::new(self.binary())),
        )
    }
}

fn announce(port: u16) -> String {
    format!("echo \"opencode server listening on http://127.0.0.1:{}\"", port)
}

pub fn fast_readiness() -> ReadinessConfig {
    ReadinessConfig {
        port_timeout_ms: 500,
        port_retry_ms: 20,
        health_timeout_ms: 1000,
        stability_ms: 100,
        ..Default::default()
    }
}

pub fn fast_bridge() -> BridgeConfig {
    BridgeConfig {
        reconnect_delay_ms: 200,
        port_poll_ms: 50,
        ..Default::default()
    }
}

/// Wait for the first event matching `predicate`.
pub async fn wait_for_event<F>(
    stream: &mut EventStream,
    within: Duration,
    predicate: F,
) -> Option<WorkspaceEvent>
where
    F: Fn(&WorkspaceEvent) -> bool,
{
    tokio::time::timeout(within, async {
        while let Some(event) = stream.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Drain every event already queued on `stream`.
pub fn drain(stream: &mut EventStream) -> Vec<WorkspaceEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.try_recv() {
        events.push(event);
    }
    events
}

pub async fn port_reachable(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

struct UpstreamState {
    health_status: AtomicU16,
    requests: AtomicUsize,
    feed: broadcast::Sender<String>,
}

/// Loopback HTTP server imitating an instance's API.
pub struct FakeUpstream {
    port: u16,
    state: Arc<UpstreamState>,
    online: Mutex<Option<CancellationToken>>,
}

impl FakeUpstream {
    pub const HEALTH_PATH: &'static str = "/project/current";
    pub const FEED_PATH: &'static str = "/event";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let port = listener.local_addr().expect("upstream addr").port();
        let (feed, _) = broadcast::channel(64);
        let state = Arc::new(UpstreamState {
            health_status: AtomicU16::new(200),
            requests: AtomicUsize::new(0),
            feed,
        });

        let token = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&state), token.clone()));

        Self {
            port,
            state,
            online: Mutex::new(Some(token)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_health_status(&self, status: u16) {
        self.state.health_status.store(status, Ordering::SeqCst);
    }

    /// Requests served so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Connected feed clients.
    pub fn feed_clients(&self) -> usize {
        self.state.feed.receiver_count()
    }

    /// Push one record to every connected feed client.
    pub fn send_event(&self, event: serde_json::Value) -> usize {
        self.state.feed.send(event.to_string()).unwrap_or(0)
    }

    /// Close the listener and every open connection.
    pub fn go_offline(&self) {
        if let Some(token) = self.online.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    /// Listen on the same port again.
    pub async fn go_online(&self) -> std::io::Result<()> {
        // The previous listener is dropped asynchronously after go_offline.
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(("127.0.0.1", self.port)).await {
                Ok(listener) => break listener,
                Err(e) if attempts >= 20 => return Err(e),
                Err(_) => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&self.state), token.clone()));
        *self.online.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        Ok(())
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.go_offline();
    }
}

async fn serve(listener: TcpListener, state: Arc<UpstreamState>, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Ok((socket, _)) = accepted else { continue };

        let state = Arc::clone(&state);
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = handle_connection(socket, state) => {}
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    state: Arc<UpstreamState>,
) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or("/").to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = raw[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    state.requests.fetch_add(1, Ordering::SeqCst);

    let path = target.split('?').next().unwrap_or_default();
    match path {
        FakeUpstream::HEALTH_PATH => {
            let status = state.health_status.load(Ordering::SeqCst);
            respond(&mut socket, status, "application/json", b"{\"directory\":\"/\"}").await
        }
        FakeUpstream::FEED_PATH => {
            let mut feed = state.feed.subscribe();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                      cache-control: no-cache\r\nconnection: close\r\n\r\n: connected\n\n",
                )
                .await?;
            while let Ok(record) = feed.recv().await {
                socket
                    .write_all(format!("data: {}\n\n", record).as_bytes())
                    .await?;
            }
            Ok(())
        }
        _ => {
            let mut echo = format!("{} {}\n", method, target).into_bytes();
            echo.extend_from_slice(&body);
            respond(&mut socket, 200, "text/plain", &echo).await
        }
    }
}

async fn respond(
    socket: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} Fake\r\ncontent-type: {}\r\ncontent-length: {}\r\n\
         x-upstream: fake\r\nconnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body).await?;
    socket.shutdown().await
}
