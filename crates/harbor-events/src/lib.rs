//! Harbor Events - lifecycle event bus
//!
//! Every state transition of a managed workspace (creation, readiness, errors,
//! shutdown, log lines, and the re-streamed feed of the instance itself) is
//! published here. Components observe each other only through this bus.
//!
//! Delivery is synchronous and fire-and-forget: subscribers registered at
//! publish time see the event, nobody else does. Clients that connect late
//! must reconcile from a state snapshot instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Publish/subscribe hub.
pub mod bus;
/// Event type definitions.
pub mod types;
/// Workspace descriptor and its status state machine.
pub mod workspace;

pub use bus::{EventBus, EventStream, Subscription, DEFAULT_STREAM_CAPACITY};
pub use types::{EventKind, InstanceStreamStatus, LogEntry, LogLevel, WorkspaceEvent};
pub use workspace::{WorkspaceDescriptor, WorkspaceStatus};
