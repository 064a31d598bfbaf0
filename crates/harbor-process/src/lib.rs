//! Harbor Process - instance runtime
//!
//! Spawns one OS process per workspace, discovers its listening port from
//! its output, reports how it exited, and verifies it is actually usable
//! before the orchestrator declares it ready.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod output;
pub mod readiness;
pub mod runtime;

pub use error::{Error, ReadinessPhase, Result};
pub use output::{OutputTail, PortAnnouncement, RegexPortParser, DEFAULT_PORT_PATTERN};
pub use readiness::{ReadinessConfig, ReadinessVerifier};
pub use runtime::{ExitInfo, ExitSignal, LaunchedProcess, ProcessRuntime, RuntimeConfig};
