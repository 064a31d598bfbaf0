use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Observable status of a managed workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    /// Process launched (or about to be), readiness not yet confirmed
    Starting,
    /// Port bound, health endpoint answering, stable
    Ready,
    /// Stopped on request or exited cleanly
    Stopped,
    /// Launch, readiness or runtime failure; see `error`
    Error,
}

impl WorkspaceStatus {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and observable state of one managed instance.
///
/// `pid` and `port` are only present while a backing OS process is alive,
/// and `error` only while `status == Error`. The `mark_*` methods keep those
/// invariants and bump `updated_at` on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDescriptor {
    /// Opaque unique id, immutable
    pub id: String,
    /// Absolute folder the instance operates on, immutable
    pub path: PathBuf,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Current lifecycle status
    pub status: WorkspaceStatus,
    /// OS process id of the backing instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Loopback port the instance listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Path prefix under which the instance is reachable through the proxy
    pub proxy_path: String,
    /// Resolved executable used to launch the instance
    pub binary_id: String,
    /// Human readable label of the executable
    pub binary_label: String,
    /// Executable version, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_version: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last status transition
    pub updated_at: DateTime<Utc>,
    /// Failure message, only while `status == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkspaceDescriptor {
    /// Build a fresh descriptor in `Starting`.
    pub fn starting(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        name: Option<String>,
        binary_id: impl Into<String>,
        binary_label: impl Into<String>,
        binary_version: Option<String>,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            proxy_path: format!("/workspaces/{}/instance", id),
            id,
            path: path.into(),
            name,
            status: WorkspaceStatus::Starting,
            pid: None,
            port: None,
            binary_id: binary_id.into(),
            binary_label: binary_label.into(),
            binary_version,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Readiness confirmed for the process `pid` listening on `port`.
    pub fn mark_ready(&mut self, pid: u32, port: u16) {
        self.status = WorkspaceStatus::Ready;
        self.pid = Some(pid);
        self.port = Some(port);
        self.error = None;
        self.touch();
    }

    /// Launch, readiness or runtime failure. The process is gone.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = WorkspaceStatus::Error;
        self.pid = None;
        self.port = None;
        self.error = Some(message.into());
        self.touch();
    }

    /// Requested shutdown or clean exit.
    pub fn mark_stopped(&mut self) {
        self.status = WorkspaceStatus::Stopped;
        self.pid = None;
        self.port = None;
        self.error = None;
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // Keep updated_at strictly monotonic even on coarse clocks.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }
}
