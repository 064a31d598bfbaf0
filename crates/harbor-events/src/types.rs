use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workspace::WorkspaceDescriptor;

/// Severity of a captured process output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Regular stdout output
    Info,
    /// Supervisor warnings (e.g. slow port announcement)
    Warn,
    /// stderr output
    Error,
}

/// One captured line of instance output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Owning workspace
    pub workspace_id: String,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Line content without trailing newline
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        workspace_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Connection state of the bridge stream for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStreamStatus {
    /// Opening the feed connection
    Connecting,
    /// First bytes received
    Connected,
    /// Stream ended or bridge stopped
    Disconnected,
    /// Read or connect failure; will retry unless cancelled
    Error,
}

/// Events published on the bus.
///
/// Each variant carries only what is relevant to the occurrence. The wire
/// form is internally tagged by `type` (e.g. `"workspace.started"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkspaceEvent {
    /// Descriptor inserted into the registry in `starting`
    #[serde(rename = "workspace.created")]
    WorkspaceCreated {
        /// Snapshot after creation
        workspace: WorkspaceDescriptor,
    },
    /// Instance passed readiness
    #[serde(rename = "workspace.started")]
    WorkspaceStarted {
        /// Snapshot in `ready`
        workspace: WorkspaceDescriptor,
    },
    /// Launch, readiness or runtime failure
    #[serde(rename = "workspace.error")]
    WorkspaceError {
        /// Snapshot in `error`
        workspace: WorkspaceDescriptor,
    },
    /// Instance stopped (requested, clean exit, or deleted)
    #[serde(rename = "workspace.stopped")]
    WorkspaceStopped {
        /// Workspace id
        #[serde(rename = "workspaceId")]
        workspace_id: String,
    },
    /// A line of instance output
    #[serde(rename = "workspace.log")]
    WorkspaceLog {
        /// Captured line
        entry: LogEntry,
    },
    /// Bridge connection state for one instance
    #[serde(rename = "instance.eventStatus")]
    InstanceStatus {
        /// Workspace id owning the instance
        #[serde(rename = "instanceId")]
        instance_id: String,
        /// New stream state
        status: InstanceStreamStatus,
        /// Failure or end reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Application event re-streamed from the instance's own feed
    #[serde(rename = "instance.event")]
    InstanceEvent {
        /// Workspace id owning the instance
        #[serde(rename = "instanceId")]
        instance_id: String,
        /// Decoded payload, forwarded untouched
        event: serde_json::Value,
    },
}

/// Event tag, used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `workspace.created`
    WorkspaceCreated,
    /// `workspace.started`
    WorkspaceStarted,
    /// `workspace.error`
    WorkspaceError,
    /// `workspace.stopped`
    WorkspaceStopped,
    /// `workspace.log`
    WorkspaceLog,
    /// `instance.eventStatus`
    InstanceStatus,
    /// `instance.event`
    InstanceEvent,
}

impl EventKind {
    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceCreated => "workspace.created",
            Self::WorkspaceStarted => "workspace.started",
            Self::WorkspaceError => "workspace.error",
            Self::WorkspaceStopped => "workspace.stopped",
            Self::WorkspaceLog => "workspace.log",
            Self::InstanceStatus => "instance.eventStatus",
            Self::InstanceEvent => "instance.event",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkspaceEvent {
    /// Tag of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkspaceCreated { .. } => EventKind::WorkspaceCreated,
            Self::WorkspaceStarted { .. } => EventKind::WorkspaceStarted,
            Self::WorkspaceError { .. } => EventKind::WorkspaceError,
            Self::WorkspaceStopped { .. } => EventKind::WorkspaceStopped,
            Self::WorkspaceLog { .. } => EventKind::WorkspaceLog,
            Self::InstanceStatus { .. } => EventKind::InstanceStatus,
            Self::InstanceEvent { .. } => EventKind::InstanceEvent,
        }
    }

    /// Workspace id the event belongs to.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::WorkspaceCreated { workspace }
            | Self::WorkspaceStarted { workspace }
            | Self::WorkspaceError { workspace } => &workspace.id,
            Self::WorkspaceStopped { workspace_id } => workspace_id,
            Self::WorkspaceLog { entry } => &entry.workspace_id,
            Self::InstanceStatus { instance_id, .. } | Self::InstanceEvent { instance_id, .. } => {
                instance_id
            }
        }
    }
}
