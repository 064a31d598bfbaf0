//! Harbor Core - workspace orchestration
//!
//! This crate owns the registry of managed workspaces and everything that
//! reacts to their lifecycle:
//! - Orchestrator: create/delete, readiness, crash detection
//! - Collaborators: binary resolution, environment overrides, cache invalidation
//! - Bridge: re-streams each instance's own event feed onto the shared bus
//! - Shutdown: coordinated graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod collaborators;
pub mod error;
pub mod orchestrator;
pub mod shutdown;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bridge::{BridgeConfig, InstanceEventBridge, InstancePortLookup};
pub use collaborators::{
    resolve_executable, BinaryResolver, ConfiguredBinaryResolver, EnvironmentProvider,
    NoopCacheInvalidator, ResolvedBinary, WorkspaceCacheInvalidator,
};
pub use error::{Error, Result};
pub use orchestrator::WorkspaceManager;
pub use shutdown::{
    shutdown_signal_with_controller, wait_for_shutdown_signal, ShutdownController, ShutdownPhase,
    TaskGuard,
};
