use super::*;

#[tokio::test]
async fn test_shutdown_phases() {
    let controller = ShutdownController::new();
    let phases = controller.subscribe();
    assert_eq!(controller.phase(), ShutdownPhase::Running);
    assert!(controller.is_accepting_work());
    assert!(!controller.is_shutting_down());

    controller.shutdown().await;

    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    assert_eq!(*phases.borrow(), ShutdownPhase::Terminated);
    assert!(!controller.is_accepting_work());
    assert!(controller.is_shutting_down());
}

#[tokio::test]
async fn test_task_guard() {
    let controller = ShutdownController::new();
    assert_eq!(controller.active_task_count(), 0);

    {
        let _create = controller.register_task();
        let _another = controller.register_task();
        assert_eq!(controller.active_task_count(), 2);
    }

    assert_eq!(controller.active_task_count(), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_work() {
    let controller = ShutdownController::with_timeout(Duration::from_secs(5));
    let guard = controller.register_task();
    let token = controller.token();

    let c = Arc::clone(&controller);
    let draining = tokio::spawn(async move { c.shutdown().await });

    token.cancelled().await;
    assert!(guard.is_cancelled());
    assert_eq!(controller.phase(), ShutdownPhase::Draining);

    drop(guard);
    draining.await.unwrap();
    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
}

#[tokio::test]
async fn test_drain_timeout() {
    let controller = ShutdownController::with_timeout(Duration::from_millis(200));
    let _stuck = controller.register_task();

    let mut phases = controller.subscribe();
    let c = Arc::clone(&controller);
    let draining = tokio::spawn(async move { c.shutdown().await });

    phases
        .wait_for(|p| *p == ShutdownPhase::Terminating || *p == ShutdownPhase::Terminated)
        .await
        .unwrap();
    draining.await.unwrap();
    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
}

#[tokio::test]
async fn test_double_shutdown() {
    let controller = ShutdownController::new();

    let c1 = Arc::clone(&controller);
    let c2 = Arc::clone(&controller);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { c1.shutdown().await }),
        tokio::spawn(async move { c2.shutdown().await })
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
}
