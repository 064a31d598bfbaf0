//! Error types for harbor-process

use std::path::PathBuf;
use thiserror::Error;

/// Readiness phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPhase {
    /// Waiting for the port to accept connections
    PortCheck,
    /// Probing the health endpoint
    HealthCheck,
    /// Waiting out the stability window
    StabilityCheck,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortCheck => write!(f, "port check"),
            Self::HealthCheck => write!(f, "health check"),
            Self::StabilityCheck => write!(f, "stability check"),
        }
    }
}

/// Runtime error type
#[derive(Debug, Error)]
pub enum Error {
    /// Folder missing or not a directory
    #[error("workspace folder does not exist or is not a directory: {}", .0.display())]
    InvalidFolder(PathBuf),

    /// A process is already supervised for this workspace
    #[error("workspace {0} already has a running process")]
    AlreadyRunning(String),

    /// The executable could not be started
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// Executable path
        binary: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Process exited before announcing its port; message is built from
    /// captured stderr
    #[error("{message}")]
    ExitedBeforePort {
        /// Workspace id
        workspace_id: String,
        /// Exit code, if any
        code: Option<i32>,
        /// Captured stderr, or a generic description when there was none
        message: String,
    },

    /// A readiness phase failed
    #[error(
        "Workspace {workspace_id} failed {phase}: {reason}{}",
        last_output_suffix(.last_output)
    )]
    Readiness {
        /// Workspace id
        workspace_id: String,
        /// Failing phase
        phase: ReadinessPhase,
        /// Underlying reason
        reason: String,
        /// Most recent output line of the process
        last_output: Option<String>,
    },

    /// Stop did not complete
    #[error("failed to stop workspace {workspace_id}: {reason}")]
    Stop {
        /// Workspace id
        workspace_id: String,
        /// Reason
        reason: String,
    },

    /// Port announcement pattern did not compile
    #[error("invalid port pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// HTTP client could not be built
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

fn last_output_suffix(last_output: &Option<String>) -> String {
    match last_output {
        Some(line) => format!(" (last output: {})", line),
        None => String::new(),
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_message_includes_context() {
        let err = Error::Readiness {
            workspace_id: "ws-1".to_string(),
            phase: ReadinessPhase::HealthCheck,
            reason: "HTTP 503 Service Unavailable".to_string(),
            last_output: Some("database locked".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Workspace ws-1 failed health check: HTTP 503 Service Unavailable \
             (last output: database locked)"
        );
    }

    #[test]
    fn test_readiness_message_without_output() {
        let err = Error::Readiness {
            workspace_id: "ws-1".to_string(),
            phase: ReadinessPhase::PortCheck,
            reason: "timed out after 5000ms".to_string(),
            last_output: None,
        };
        assert_eq!(
            err.to_string(),
            "Workspace ws-1 failed port check: timed out after 5000ms"
        );
    }
}
