//! Readiness verification
//!
//! Runs once per successful launch: port wait, health probe, stability
//! window. Every phase races the exit signal so a process dying mid-check
//! fails fast.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::{Error, ReadinessPhase, Result};
use crate::runtime::LaunchedProcess;

/// Readiness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Path probed with a GET once the port accepts connections
    pub health_path: String,
    /// Deadline for the port to accept connections
    pub port_timeout_ms: u64,
    /// Delay between connect attempts
    pub port_retry_ms: u64,
    /// Request timeout of the health probe
    pub health_timeout_ms: u64,
    /// Time the process must stay alive after passing the probe
    pub stability_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_path: "/project/current".to_string(),
            port_timeout_ms: 5000,
            port_retry_ms: 100,
            health_timeout_ms: 5000,
            stability_ms: 1500,
        }
    }
}

/// Decides whether a freshly launched instance is usable.
#[derive(Debug, Clone)]
pub struct ReadinessVerifier {
    config: ReadinessConfig,
    client: reqwest::Client,
}

impl ReadinessVerifier {
    /// Build a verifier with its own HTTP client.
    pub fn new(config: ReadinessConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.health_timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    /// Readiness settings
    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Run all phases in order.
    ///
    /// The returned error names the workspace, the failing phase, the reason
    /// and the last line the process printed.
    pub async fn verify(&self, workspace_id: &str, process: &LaunchedProcess) -> Result<()> {
        let port = process.port;

        self.run_phase(workspace_id, ReadinessPhase::PortCheck, process, self.wait_for_port(port))
            .await?;
        self.run_phase(workspace_id, ReadinessPhase::HealthCheck, process, self.probe_health(port))
            .await?;

        let stability = Duration::from_millis(self.config.stability_ms);
        self.run_phase(workspace_id, ReadinessPhase::StabilityCheck, process, async {
            sleep(stability).await;
            Ok(())
        })
        .await?;

        info!(workspace_id = %workspace_id, port, "Instance passed readiness checks");
        Ok(())
    }

    async fn run_phase<F>(
        &self,
        workspace_id: &str,
        phase: ReadinessPhase,
        process: &LaunchedProcess,
        check: F,
    ) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), String>>,
    {
        debug!(workspace_id = %workspace_id, %phase, "Readiness phase started");
        let mut exit = process.exit.clone();

        let outcome = tokio::select! {
            biased;

            info = exit.wait() => Err(format!("process exited with {}", info.describe())),
            result = check => result,
        };

        outcome.map_err(|reason| Error::Readiness {
            workspace_id: workspace_id.to_string(),
            phase,
            reason,
            last_output: process.output.last_line(),
        })
    }

    async fn wait_for_port(&self, port: u16) -> std::result::Result<(), String> {
        let deadline = Instant::now() + Duration::from_millis(self.config.port_timeout_ms);
        let retry = Duration::from_millis(self.config.port_retry_ms);

        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(format!(
                        "port {} not accepting connections after {}ms: {}",
                        port, self.config.port_timeout_ms, e
                    ));
                }
                Err(_) => sleep(retry).await,
            }
        }
    }

    async fn probe_health(&self, port: u16) -> std::result::Result<(), String> {
        let url = format!("http://127.0.0.1:{}{}", port, self.config.health_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(format!("HTTP {}", status));
        }
        Ok(())
    }
}
