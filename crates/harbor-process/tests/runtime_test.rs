#![cfg(unix)]

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use common::{announce, runtime_config, script, sh};
use harbor_events::{EventBus, LogLevel, WorkspaceEvent};
use harbor_process::{Error, ProcessRuntime, RuntimeConfig};
use tokio::time::{timeout, Instant};

fn logs(stream: &mut harbor_events::EventStream) -> Vec<(LogLevel, String)> {
    let mut out = Vec::new();
    while let Some(event) = stream.try_recv() {
        if let WorkspaceEvent::WorkspaceLog { entry } = event {
            out.push((entry.level, entry.message));
        }
    }
    out
}

#[tokio::test]
async fn test_launch_discovers_port_and_publishes_logs() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "echo booting\necho 'warming cache' >&2\n{}\nexec sleep 300",
        announce(43123)
    );
    let script = script(dir.path(), &body);

    let bus = EventBus::new();
    let mut events = bus.stream();
    let runtime = ProcessRuntime::new(bus, runtime_config(&script)).unwrap();

    let launched = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();

    assert_eq!(launched.port, 43123);
    assert!(launched.pid > 0);
    assert!(runtime.is_running("w1"));
    assert_eq!(runtime.active_processes(), 1);
    assert!(launched.exit.current().is_none());

    let lines = logs(&mut events);
    assert!(lines.contains(&(LogLevel::Info, "booting".to_string())));
    assert!(lines
        .iter()
        .any(|(level, msg)| *level == LogLevel::Info && msg.contains("listening on")));

    runtime.stop("w1").await.unwrap();
    let info = launched.exit.current().unwrap();
    assert!(info.requested_stop);
    assert_eq!(runtime.active_processes(), 0);

    // output readers are drained before the exit is reported
    assert!(launched.output.stderr_text().contains("warming cache"));
}

#[tokio::test]
async fn test_environment_is_passed_to_instance() {
    let dir = tempfile::tempdir().unwrap();
    let body = "echo \"server listening on http://127.0.0.1:$HARBOR_TEST_PORT\"\nexec sleep 300";
    let script = script(dir.path(), body);

    let runtime = ProcessRuntime::new(EventBus::new(), runtime_config(&script)).unwrap();
    let env = HashMap::from([("HARBOR_TEST_PORT".to_string(), "45001".to_string())]);

    let launched = runtime.launch("w1", dir.path(), sh(), &env).await.unwrap();
    assert_eq!(launched.port, 45001);
    runtime.stop("w1").await.unwrap();
}

#[tokio::test]
async fn test_exit_before_port_reports_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(dir.path(), "echo 'fatal: config missing' >&2\nexit 1");
    let runtime = ProcessRuntime::new(EventBus::new(), runtime_config(&script)).unwrap();

    let err = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap_err();

    match err {
        Error::ExitedBeforePort { code, message, .. } => {
            assert_eq!(code, Some(1));
            assert!(message.contains("fatal: config missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.active_processes(), 0);
}

#[tokio::test]
async fn test_exit_before_port_without_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(dir.path(), "echo 'nothing to see'\nexit 3");
    let runtime = ProcessRuntime::new(EventBus::new(), runtime_config(&script)).unwrap();

    let err = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Process exited with code 3 before announcing a port"
    );
}

#[tokio::test]
async fn test_second_launch_for_same_workspace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(dir.path(), &format!("{}\nexec sleep 300", announce(43124)));
    let runtime = ProcessRuntime::new(EventBus::new(), runtime_config(&script)).unwrap();

    runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();
    let err = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning(_)));
    assert_eq!(runtime.active_processes(), 1);

    runtime.stop_all().await;
    assert_eq!(runtime.active_processes(), 0);
}

#[tokio::test]
async fn test_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ProcessRuntime::new(EventBus::new(), RuntimeConfig::default()).unwrap();

    let err = runtime
        .launch(
            "w1",
            dir.path(),
            Path::new("/nonexistent/harbor-instance"),
            &HashMap::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
    assert_eq!(runtime.active_processes(), 0);
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("trap '' TERM\n{}\nwhile true; do sleep 1; done", announce(43125));
    let script = script(dir.path(), &body);
    let config = RuntimeConfig {
        stop_grace_ms: 300,
        ..runtime_config(&script)
    };
    let runtime = ProcessRuntime::new(EventBus::new(), config).unwrap();

    let launched = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();

    let started = Instant::now();
    runtime.stop("w1").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    let info = launched.exit.current().unwrap();
    assert!(info.requested_stop);
    assert_eq!(info.signal, Some(9));
    assert!(!runtime.is_running("w1"));
}

#[tokio::test]
async fn test_unrequested_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{}\nsleep 0.3\nexit 2", announce(43126));
    let script = script(dir.path(), &body);
    let runtime = ProcessRuntime::new(EventBus::new(), runtime_config(&script)).unwrap();

    let mut launched = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();

    let info = timeout(Duration::from_secs(5), launched.exit.wait())
        .await
        .unwrap();
    assert_eq!(info.code, Some(2));
    assert!(!info.requested_stop);
    assert!(!runtime.is_running("w1"));

    // stopping an exited instance resolves immediately
    runtime.stop("w1").await.unwrap();
}

#[tokio::test]
async fn test_stop_after_exit_while_output_drains() {
    let dir = tempfile::tempdir().unwrap();
    // The background sleep keeps stdout open after the shell exits.
    let body = format!("{}\nsleep 2 &\nsleep 0.2\nexit 0", announce(43128));
    let script = script(dir.path(), &body);
    let config = RuntimeConfig {
        stop_grace_ms: 2000,
        ..runtime_config(&script)
    };
    let runtime = ProcessRuntime::new(EventBus::new(), config).unwrap();

    let mut launched = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();

    // Wait until the shell has been reaped; its pid no longer exists.
    let pid = nix::unistd::Pid::from_raw(i32::try_from(launched.pid).unwrap());
    let reaped = timeout(Duration::from_secs(5), async {
        while nix::sys::signal::kill(pid, None).is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reaped.is_ok());
    assert!(launched.exit.current().is_none());
    assert!(runtime.is_running("w1"));

    let started = Instant::now();
    runtime.stop("w1").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));

    let info = launched.exit.wait().await;
    assert_eq!(info.code, Some(0));
    assert_eq!(info.signal, None);
    assert!(!info.requested_stop);
    assert!(!runtime.is_running("w1"));
}

#[tokio::test]
async fn test_slow_port_announcement_warns() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("sleep 1.5\n{}\nexec sleep 300", announce(43127));
    let script = script(dir.path(), &body);
    let config = RuntimeConfig {
        port_warning_interval_secs: 1,
        ..runtime_config(&script)
    };

    let bus = EventBus::new();
    let mut events = bus.stream();
    let runtime = ProcessRuntime::new(bus, config).unwrap();

    let launched = runtime
        .launch("w1", dir.path(), sh(), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(launched.port, 43127);

    let lines = logs(&mut events);
    assert!(lines
        .iter()
        .any(|(level, msg)| *level == LogLevel::Warn && msg.contains("waiting for port")));

    runtime.stop("w1").await.unwrap();
}
