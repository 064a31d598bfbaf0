//! Shared fixtures: a shell-script instance and a stub HTTP endpoint.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use harbor_process::{ReadinessConfig, RuntimeConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Line the default port pattern recognises.
pub fn announce(port: u16) -> String {
    format!("echo \"opencode server listening on http://127.0.0.1:{}\"", port)
}

/// Write `body` as a shell script inside `dir`.
///
/// The script is run as `/bin/sh <script>` so it never needs the exec bit.
pub fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("instance.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

pub fn sh() -> &'static Path {
    Path::new("/bin/sh")
}

pub fn runtime_config(script: &Path) -> RuntimeConfig {
    RuntimeConfig {
        args: vec![script.display().to_string()],
        stop_grace_ms: 500,
        ..Default::default()
    }
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

/// Port that nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal HTTP endpoint answering every request with a fixed status.
pub struct StubServer {
    pub port: u16,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let body = "{}";
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { port, hits, task }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
