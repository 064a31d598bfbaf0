//! Process runtime
//!
//! Spawns and supervises one OS process per workspace id. Output lines are
//! republished on the bus as `workspace.log` events and scanned once for the
//! announced listening port. Stop signals are delivered by the supervisor
//! task that owns the child, so a pid is never signalled after it was reaped.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use harbor_events::{EventBus, LogEntry, LogLevel, WorkspaceEvent};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::output::{OutputTail, PortAnnouncement, RegexPortParser, DEFAULT_PORT_PATTERN};

/// Time allowed for output readers to drain after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for a killed process to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Launch and stop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Arguments asking the instance to bind an ephemeral port and log verbosely
    pub args: Vec<String>,
    /// Port announcement regex; capture group 1 is the port
    pub port_pattern: String,
    /// Interval of the "still waiting for port" warning
    pub port_warning_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            args: ["serve", "--port", "0", "--print-logs", "--log-level", "DEBUG"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            port_pattern: DEFAULT_PORT_PATTERN.to_string(),
            port_warning_interval_secs: 10,
            stop_grace_ms: 2000,
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
    /// `stop()` was called before the process exited
    pub requested_stop: bool,
}

impl ExitInfo {
    /// Human readable exit description, e.g. `code 1` or `signal 9`.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Resolves once the process has exited.
///
/// Every clone observes the same exit.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitSignal {
    /// Exit info if the process already exited.
    pub fn current(&self) -> Option<ExitInfo> {
        *self.rx.borrow()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> ExitInfo {
        match self.rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or_default(),
            // Supervisor task is gone; the child went with it (kill_on_drop).
            Err(_) => ExitInfo::default(),
        }
    }
}

/// Result of a successful launch
#[derive(Debug, Clone)]
pub struct LaunchedProcess {
    /// OS process id
    pub pid: u32,
    /// Announced listening port
    pub port: u16,
    /// Exit notification
    pub exit: ExitSignal,
    /// Recent output accessor
    pub output: OutputTail,
}

/// Request handled by the supervisor task while the child is unreaped.
#[derive(Debug, Clone, Copy)]
enum StopRequest {
    Terminate,
    Kill,
}

struct ManagedProcess {
    pid: u32,
    requested_stop: Arc<AtomicBool>,
    exit: ExitSignal,
    control: mpsc::Sender<StopRequest>,
}

#[derive(Clone)]
struct OutputPump {
    workspace_id: String,
    bus: EventBus,
    parser: Arc<dyn PortAnnouncement>,
    tail: OutputTail,
}

impl OutputPump {
    async fn run<R>(
        self,
        reader: Option<R>,
        is_stderr: bool,
        mut port_tx: Option<oneshot::Sender<u16>>,
    ) where
        R: AsyncRead + Unpin,
    {
        let Some(reader) = reader else { return };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\r', '\n']);
                    if !line.trim().is_empty() {
                        self.handle_line(line, is_stderr, &mut port_tx);
                    }
                }
                Err(e) => {
                    debug!(
                        workspace_id = %self.workspace_id,
                        error = %e,
                        "Output stream read failed"
                    );
                    break;
                }
            }
        }
    }

    fn handle_line(
        &self,
        line: &str,
        is_stderr: bool,
        port_tx: &mut Option<oneshot::Sender<u16>>,
    ) {
        self.tail.record(line, is_stderr);

        let level = if is_stderr {
            debug!(workspace_id = %self.workspace_id, stream = "stderr", "{}", line);
            LogLevel::Error
        } else {
            debug!(workspace_id = %self.workspace_id, stream = "stdout", "{}", line);
            LogLevel::Info
        };
        self.bus.publish(WorkspaceEvent::WorkspaceLog {
            entry: LogEntry::new(&self.workspace_id, level, line),
        });

        if port_tx.is_some() {
            if let Some(port) = self.parser.parse_port(line) {
                if let Some(tx) = port_tx.take() {
                    let _ = tx.send(port);
                }
            }
        }
    }
}

/// Supervisor for workspace instance processes.
///
/// At most one process is tracked per workspace id. Cloning shares the same
/// process table.
#[derive(Clone)]
pub struct ProcessRuntime {
    bus: EventBus,
    parser: Arc<dyn PortAnnouncement>,
    config: RuntimeConfig,
    processes: Arc<DashMap<String, ManagedProcess>>,
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("config", &self.config)
            .field("active", &self.processes.len())
            .finish()
    }
}

impl ProcessRuntime {
    /// Create a runtime using the configured port pattern.
    pub fn new(bus: EventBus, config: RuntimeConfig) -> Result<Self> {
        let parser = RegexPortParser::new(&config.port_pattern)?;
        Ok(Self::with_parser(bus, config, Arc::new(parser)))
    }

    /// Create a runtime with a custom port parser.
    pub fn with_parser(
        bus: EventBus,
        config: RuntimeConfig,
        parser: Arc<dyn PortAnnouncement>,
    ) -> Self {
        Self {
            bus,
            parser,
            config,
            processes: Arc::new(DashMap::new()),
        }
    }

    /// Runtime settings
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn `binary` in `folder` and wait for it to announce a port.
    ///
    /// `environment` is merged over the current process environment. Fails
    /// if the folder is not a directory, the binary cannot be spawned, or the
    /// process exits before announcing a port.
    pub async fn launch(
        &self,
        workspace_id: &str,
        folder: &Path,
        binary: &Path,
        environment: &HashMap<String, String>,
    ) -> Result<LaunchedProcess> {
        if !folder.is_dir() {
            return Err(Error::InvalidFolder(folder.to_path_buf()));
        }
        if self.processes.contains_key(workspace_id) {
            return Err(Error::AlreadyRunning(workspace_id.to_string()));
        }

        let mut child = Command::new(binary)
            .args(&self.config.args)
            .current_dir(folder)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                binary: binary.display().to_string(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        info!(workspace_id = %workspace_id, pid, binary = %binary.display(), "Instance spawned");

        let pump = OutputPump {
            workspace_id: workspace_id.to_string(),
            bus: self.bus.clone(),
            parser: Arc::clone(&self.parser),
            tail: OutputTail::default(),
        };
        let output = pump.tail.clone();
        let (port_tx, mut port_rx) = oneshot::channel::<u16>();
        let stdout_task =
            tokio::spawn(pump.clone().run(child.stdout.take(), false, Some(port_tx)));
        let stderr_task = tokio::spawn(pump.run(child.stderr.take(), true, None));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (control, mut control_rx) = mpsc::channel::<StopRequest>(4);
        let requested_stop = Arc::new(AtomicBool::new(false));
        let exit = ExitSignal { rx: exit_rx };

        match self.processes.entry(workspace_id.to_string()) {
            Entry::Occupied(_) => {
                // Lost a race with a concurrent launch; dropping the child kills it.
                return Err(Error::AlreadyRunning(workspace_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ManagedProcess {
                    pid,
                    requested_stop: Arc::clone(&requested_stop),
                    exit: exit.clone(),
                    control,
                });
            }
        }

        let processes = Arc::clone(&self.processes);
        let id = workspace_id.to_string();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(request) = control_rx.recv() => match request {
                        // `id()` is None once the child has been reaped.
                        StopRequest::Terminate => {
                            if !child.id().is_some_and(terminate) {
                                let _ = child.start_kill();
                            }
                        }
                        StopRequest::Kill => {
                            let _ = child.start_kill();
                        }
                    },
                }
            };
            drop(control_rx);
            let requested_stop = requested_stop.load(Ordering::SeqCst);

            let _ = timeout(OUTPUT_DRAIN_TIMEOUT, async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            })
            .await;

            let info = ExitInfo {
                code: status.as_ref().ok().and_then(|s| s.code()),
                signal: status.as_ref().ok().and_then(exit_signal_number),
                requested_stop,
            };
            info!(
                workspace_id = %id,
                pid,
                code = ?info.code,
                signal = ?info.signal,
                requested = info.requested_stop,
                "Instance exited"
            );

            processes.remove_if(&id, |_, p| p.pid == pid);
            exit_tx.send_replace(Some(info));
        });

        let warn_every = Duration::from_secs(self.config.port_warning_interval_secs.max(1));
        let mut warn_tick = interval_at(Instant::now() + warn_every, warn_every);
        let mut exit_wait = exit.clone();
        let started = Instant::now();
        let mut stdout_open = true;

        loop {
            tokio::select! {
                biased;

                port = &mut port_rx, if stdout_open => match port {
                    Ok(port) => {
                        info!(workspace_id = %workspace_id, pid, port, "Instance announced port");
                        return Ok(LaunchedProcess { pid, port, exit, output });
                    }
                    Err(_) => stdout_open = false,
                },
                info = exit_wait.wait() => {
                    return Err(exited_before_port(workspace_id, info, &output));
                }
                _ = warn_tick.tick() => {
                    let waited = started.elapsed().as_secs();
                    warn!(
                        workspace_id = %workspace_id,
                        pid,
                        waited_secs = waited,
                        "Instance has not announced a port yet"
                    );
                    self.bus.publish(WorkspaceEvent::WorkspaceLog {
                        entry: LogEntry::new(
                            workspace_id,
                            LogLevel::Warn,
                            format!("Still waiting for port announcement after {}s", waited),
                        ),
                    });
                }
            }
        }
    }

    /// Stop the process for `workspace_id`.
    ///
    /// Sends SIGTERM, escalates to a forced kill after the grace period, and
    /// resolves once the exit was observed. Resolves immediately when no
    /// process is running.
    pub async fn stop(&self, workspace_id: &str) -> Result<()> {
        let (pid, mut exit, control) = {
            let Some(process) = self.processes.get(workspace_id) else {
                return Ok(());
            };
            process.requested_stop.store(true, Ordering::SeqCst);
            (process.pid, process.exit.clone(), process.control.clone())
        };
        if exit.current().is_some() {
            return Ok(());
        }

        let grace = Duration::from_millis(self.config.stop_grace_ms);
        info!(workspace_id = %workspace_id, pid, "Stopping instance");

        // A closed channel means the child was already reaped.
        let _ = control.send(StopRequest::Terminate).await;
        if timeout(grace, exit.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(workspace_id = %workspace_id, pid, "Instance ignored graceful stop, killing");
        let _ = control.send(StopRequest::Kill).await;

        match timeout(KILL_TIMEOUT + OUTPUT_DRAIN_TIMEOUT, exit.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Stop {
                workspace_id: workspace_id.to_string(),
                reason: format!("process {} did not exit after kill", pid),
            }),
        }
    }

    /// Stop every supervised process; failures are logged.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(workspace_id = %id, error = %e, "Failed to stop instance");
            }
        }
    }

    /// Whether a process is supervised for `workspace_id`.
    pub fn is_running(&self, workspace_id: &str) -> bool {
        self.processes.contains_key(workspace_id)
    }

    /// Number of supervised processes.
    pub fn active_processes(&self) -> usize {
        self.processes.len()
    }
}

fn exited_before_port(workspace_id: &str, info: ExitInfo, output: &OutputTail) -> Error {
    let stderr = output.stderr_text();
    let message = if stderr.trim().is_empty() {
        format!("Process exited with {} before announcing a port", info.describe())
    } else {
        stderr
    };
    warn!(
        workspace_id = %workspace_id,
        code = ?info.code,
        "Instance exited before announcing a port"
    );
    Error::ExitedBeforePort {
        workspace_id: workspace_id.to_string(),
        code: info.code,
        message,
    }
}

#[cfg(unix)]
fn exit_signal_number(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal_number(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "Failed to signal process");
            false
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_request_ephemeral_port() {
        let config = RuntimeConfig::default();
        assert_eq!(
            config.args,
            vec!["serve", "--port", "0", "--print-logs", "--log-level", "DEBUG"]
        );
        assert_eq!(config.stop_grace_ms, 2000);
        assert_eq!(config.port_warning_interval_secs, 10);
    }

    #[test]
    fn test_exit_description() {
        let code = ExitInfo {
            code: Some(1),
            ..Default::default()
        };
        assert_eq!(code.describe(), "code 1");
        let signal = ExitInfo {
            signal: Some(9),
            ..Default::default()
        };
        assert_eq!(signal.describe(), "signal 9");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = RuntimeConfig {
            port_pattern: "(".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ProcessRuntime::new(EventBus::new(), config),
            Err(Error::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_workspace_is_noop() {
        let runtime = ProcessRuntime::new(EventBus::new(), RuntimeConfig::default()).unwrap();
        runtime.stop("missing").await.unwrap();
        assert_eq!(runtime.active_processes(), 0);
    }

    #[tokio::test]
    async fn test_launch_rejects_missing_folder() {
        let runtime = ProcessRuntime::new(EventBus::new(), RuntimeConfig::default()).unwrap();
        let err = runtime
            .launch(
                "w1",
                Path::new("/definitely/not/here"),
                Path::new("/bin/sh"),
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFolder(_)));
        assert_eq!(runtime.active_processes(), 0);
    }
}
