//! Workspace Registry / Orchestrator
//!
//! Owns the map of workspace id to descriptor and drives every lifecycle
//! transition. Each workspace has a lifecycle lock so the create flow, the
//! exit watcher and `delete` never transition the same id concurrently.
//!
//! Events are always published after the registry entry is released;
//! subscribers are free to read the registry from their handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use harbor_events::{EventBus, WorkspaceDescriptor, WorkspaceEvent, WorkspaceStatus};
use harbor_process::{ExitSignal, LaunchedProcess, ProcessRuntime, ReadinessVerifier};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::InstancePortLookup;
use crate::collaborators::{
    resolve_executable, BinaryResolver, EnvironmentProvider, NoopCacheInvalidator,
    WorkspaceCacheInvalidator,
};
use crate::error::{Error, Result};

struct WorkspaceSlot {
    descriptor: WorkspaceDescriptor,
    lifecycle: Arc<Mutex<()>>,
    startup: CancellationToken,
}

/// Registry and lifecycle driver for managed workspaces.
pub struct WorkspaceManager {
    bus: EventBus,
    runtime: ProcessRuntime,
    verifier: ReadinessVerifier,
    binaries: Arc<dyn BinaryResolver>,
    environment: Arc<dyn EnvironmentProvider>,
    caches: Arc<dyn WorkspaceCacheInvalidator>,
    workspaces: Arc<DashMap<String, WorkspaceSlot>>,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("workspaces", &self.workspaces.len())
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl WorkspaceManager {
    /// Create a manager with no environment overrides and no caches.
    pub fn new(
        bus: EventBus,
        runtime: ProcessRuntime,
        verifier: ReadinessVerifier,
        binaries: Arc<dyn BinaryResolver>,
    ) -> Self {
        Self {
            bus,
            runtime,
            verifier,
            binaries,
            environment: Arc::new(HashMap::<String, String>::new()),
            caches: Arc::new(NoopCacheInvalidator),
            workspaces: Arc::new(DashMap::new()),
        }
    }

    /// Environment overrides for launched instances
    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = environment;
        self
    }

    /// Caches invalidated on create/delete
    pub fn with_cache_invalidator(mut self, caches: Arc<dyn WorkspaceCacheInvalidator>) -> Self {
        self.caches = caches;
        self
    }

    /// Shared event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Process runtime (instrumentation)
    pub fn runtime(&self) -> &ProcessRuntime {
        &self.runtime
    }

    /// Create a workspace for `path` and start its instance.
    ///
    /// The descriptor is registered in `starting` and `workspace.created` is
    /// published before launching. On success the returned descriptor is
    /// `ready`. On failure the descriptor stays registered in `error`,
    /// `workspace.error` is published, and the error is returned.
    pub async fn create(
        &self,
        path: impl AsRef<Path>,
        name: Option<String>,
    ) -> Result<WorkspaceDescriptor> {
        let binary = self.binaries.resolve_default().await?;
        let executable = resolve_executable(&binary.path)?;
        let root = absolute_root(path.as_ref())?;

        let id = Uuid::new_v4().to_string();
        let descriptor = WorkspaceDescriptor::starting(
            &id,
            root.clone(),
            name,
            executable.display().to_string(),
            binary.label,
            binary.version,
        );

        let lifecycle = Arc::new(Mutex::new(()));
        let startup = CancellationToken::new();
        // Held until the create flow settles; delete and the exit watcher queue behind it.
        let guard = Arc::clone(&lifecycle).lock_owned().await;

        self.workspaces.insert(
            id.clone(),
            WorkspaceSlot {
                descriptor: descriptor.clone(),
                lifecycle: Arc::clone(&lifecycle),
                startup: startup.clone(),
            },
        );
        info!(
            workspace_id = %id,
            path = %root.display(),
            binary = %executable.display(),
            "Workspace created"
        );
        self.bus.publish(WorkspaceEvent::WorkspaceCreated { workspace: descriptor });
        self.caches.invalidate(&root);

        let environment = self.environment.environment();
        let outcome = tokio::select! {
            _ = startup.cancelled() => Err(Error::Cancelled(id.clone())),
            result = self.launch_and_verify(&id, &root, &executable, &environment) => result,
        };
        let outcome = match outcome {
            Ok(_) if startup.is_cancelled() => Err(Error::Cancelled(id.clone())),
            other => other,
        };

        let launched = match outcome {
            Ok(launched) => launched,
            Err(err) => {
                if let Err(stop_err) = self.runtime.stop(&id).await {
                    warn!(
                        workspace_id = %id,
                        error = %stop_err,
                        "Failed to stop instance after failed start"
                    );
                }
                if !matches!(err, Error::Cancelled(_)) {
                    self.record_failure(&id, &err);
                }
                drop(guard);
                return Err(err);
            }
        };

        let ready = {
            let Some(mut slot) = self.workspaces.get_mut(&id) else {
                return Err(Error::Cancelled(id));
            };
            slot.descriptor.mark_ready(launched.pid, launched.port);
            slot.descriptor.clone()
        };
        info!(workspace_id = %id, pid = launched.pid, port = launched.port, "Workspace ready");
        self.bus.publish(WorkspaceEvent::WorkspaceStarted {
            workspace: ready.clone(),
        });

        self.watch_exit(id, launched.exit, lifecycle);
        drop(guard);
        Ok(ready)
    }

    async fn launch_and_verify(
        &self,
        id: &str,
        root: &Path,
        executable: &Path,
        environment: &HashMap<String, String>,
    ) -> Result<LaunchedProcess> {
        let launched = self.runtime.launch(id, root, executable, environment).await?;
        self.verifier.verify(id, &launched).await?;
        Ok(launched)
    }

    fn record_failure(&self, id: &str, err: &Error) {
        let message = err.to_string();
        error!(workspace_id = %id, error = %message, "Workspace failed to start");

        let snapshot = self.workspaces.get_mut(id).map(|mut slot| {
            slot.descriptor.mark_error(message);
            slot.descriptor.clone()
        });
        if let Some(workspace) = snapshot {
            self.bus.publish(WorkspaceEvent::WorkspaceError { workspace });
        }
    }

    /// React to the exit of a ready instance.
    fn watch_exit(&self, id: String, mut exit: ExitSignal, lifecycle: Arc<Mutex<()>>) {
        let workspaces = Arc::clone(&self.workspaces);
        let bus = self.bus.clone();

        tokio::spawn(async move {
            let info = exit.wait().await;
            let _guard = lifecycle.lock().await;

            let event = match workspaces.get_mut(&id) {
                // Removed by delete while stopping.
                None => WorkspaceEvent::WorkspaceStopped {
                    workspace_id: id.clone(),
                },
                Some(mut slot) if info.requested_stop || info.code == Some(0) => {
                    slot.descriptor.mark_stopped();
                    WorkspaceEvent::WorkspaceStopped {
                        workspace_id: id.clone(),
                    }
                }
                Some(mut slot) => {
                    slot.descriptor
                        .mark_error(format!("Process exited with {}", info.describe()));
                    WorkspaceEvent::WorkspaceError {
                        workspace: slot.descriptor.clone(),
                    }
                }
            };

            match &event {
                WorkspaceEvent::WorkspaceError { .. } => {
                    warn!(
                        workspace_id = %id,
                        exit = %info.describe(),
                        "Instance exited unexpectedly"
                    )
                }
                _ => info!(workspace_id = %id, exit = %info.describe(), "Instance stopped"),
            }
            bus.publish(event);
        });
    }

    /// Delete a workspace, stopping its instance first.
    ///
    /// Stop failures are logged; the descriptor is removed regardless. An
    /// in-flight start is cancelled.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (lifecycle, startup) = {
            let slot = self
                .workspaces
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            (Arc::clone(&slot.lifecycle), slot.startup.clone())
        };

        startup.cancel();
        let _guard = lifecycle.lock().await;

        let was_running = self.runtime.is_running(id);
        if was_running {
            if let Err(e) = self.runtime.stop(id).await {
                warn!(workspace_id = %id, error = %e, "Failed to stop instance during delete");
            }
        }

        let Some((_, slot)) = self.workspaces.remove(id) else {
            debug!(workspace_id = %id, "Workspace already removed");
            return Ok(());
        };
        info!(workspace_id = %id, was_running, "Workspace deleted");

        if !was_running {
            // No exit watcher will fire for this id.
            self.bus.publish(WorkspaceEvent::WorkspaceStopped {
                workspace_id: id.to_string(),
            });
        }
        self.caches.invalidate(&slot.descriptor.path);
        Ok(())
    }

    /// Snapshot of one descriptor.
    pub fn get(&self, id: &str) -> Option<WorkspaceDescriptor> {
        self.workspaces.get(id).map(|slot| slot.descriptor.clone())
    }

    /// Snapshot of all descriptors, oldest first.
    pub fn list(&self) -> Vec<WorkspaceDescriptor> {
        let mut all: Vec<WorkspaceDescriptor> = self
            .workspaces
            .iter()
            .map(|slot| slot.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Port of a ready instance.
    pub fn instance_port(&self, id: &str) -> Option<u16> {
        self.workspaces.get(id).and_then(|slot| match slot.descriptor.status {
            WorkspaceStatus::Ready => slot.descriptor.port,
            _ => None,
        })
    }

    /// Cancel pending starts and stop every running instance.
    pub async fn shutdown_all(&self) {
        for slot in self.workspaces.iter() {
            slot.startup.cancel();
        }
        info!(active = self.runtime.active_processes(), "Stopping all instances");
        self.runtime.stop_all().await;
    }
}

impl InstancePortLookup for WorkspaceManager {
    fn instance_port(&self, workspace_id: &str) -> Option<u16> {
        WorkspaceManager::instance_port(self, workspace_id)
    }
}

fn absolute_root(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| {
        Error::Internal(format!("invalid workspace path {}: {}", path.display(), e))
    })
}
