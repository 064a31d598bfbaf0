use std::sync::Arc;
use std::time::Duration;

use harbor_core::testing::{FakeInstance, FakeUpstream};
use harbor_events::EventBus;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::serve_until;
use crate::api::test_support::wired;

#[tokio::test]
async fn test_shutdown_completes_with_open_streams() {
    let upstream = FakeUpstream::start().await;
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::serving(upstream.port());
    let manager = Arc::new(instance.manager(EventBus::new()));
    let workspace = manager.create(folder.path(), None).await.unwrap();

    let (router, shutdown, bridge) = wired(Arc::clone(&manager));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (trigger, signal) = oneshot::channel::<()>();
    let controller = Arc::clone(&shutdown);
    let server = tokio::spawn(serve_until(
        listener,
        router,
        shutdown,
        bridge,
        Arc::clone(&manager),
        async move {
            let _ = signal.await;
            controller.shutdown().await;
        },
    ));

    let client = reqwest::Client::new();
    let events = client
        .get(format!("http://{}/api/events", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), 200);

    let feed = client
        .get(format!(
            "http://{}/workspaces/{}/instance{}",
            addr,
            workspace.id,
            FakeUpstream::FEED_PATH
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(feed.status(), 200);

    trigger.send(()).unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(finished.is_ok(), "server still draining open streams");
    finished.unwrap().unwrap().unwrap();

    assert!(tokio::time::timeout(Duration::from_secs(1), events.bytes())
        .await
        .is_ok());
    assert!(tokio::time::timeout(Duration::from_secs(1), feed.bytes())
        .await
        .is_ok());

    assert_eq!(manager.runtime().active_processes(), 0);
}
