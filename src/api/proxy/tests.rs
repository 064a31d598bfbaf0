use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use harbor_core::testing::{FakeInstance, FakeUpstream};
use harbor_events::EventBus;
use tower::ServiceExt;

use super::{instance_subpath, upstream_url};
use crate::api::test_support::{app, body_bytes, body_json};

#[test]
fn test_upstream_url() {
    assert_eq!(upstream_url(4100, "", None), "http://127.0.0.1:4100/");
    assert_eq!(
        upstream_url(4100, "session/abc", Some("limit=5")),
        "http://127.0.0.1:4100/session/abc?limit=5"
    );
    assert_eq!(upstream_url(4100, "/event", None), "http://127.0.0.1:4100/event");
}

#[test]
fn test_instance_subpath_keeps_encoding() {
    assert_eq!(instance_subpath("/workspaces/ws-1/instance"), "");
    assert_eq!(instance_subpath("/workspaces/ws-1/instance/"), "/");
    assert_eq!(
        instance_subpath("/workspaces/ws-1/instance/file/a%3Fb%2Fc%20d"),
        "/file/a%3Fb%2Fc%20d"
    );
    assert_eq!(instance_subpath("/workspaces/ws%201/instance/session"), "/session");
}

#[tokio::test]
async fn test_unknown_workspace_is_not_found() {
    let instance = FakeInstance::serving(1);
    let manager = Arc::new(instance.manager(EventBus::new()));
    let (router, _) = app(manager);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/workspaces/missing/instance/session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "WORKSPACE_NOT_FOUND");
}

#[tokio::test]
async fn test_errored_workspace_is_not_ready() {
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::failing("address already in use", 1);
    let manager = Arc::new(instance.manager(EventBus::new()));
    assert!(manager.create(folder.path(), None).await.is_err());
    let id = manager.list()[0].id.clone();

    let (router, _) = app(manager);
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/workspaces/{}/instance/session", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "UPSTREAM_NOT_READY");
}

#[tokio::test]
async fn test_forwards_to_instance() {
    let upstream = FakeUpstream::start().await;
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::serving(upstream.port());
    let manager = Arc::new(instance.manager(EventBus::new()));
    let workspace = manager.create(folder.path(), None).await.unwrap();

    let (router, _) = app(Arc::clone(&manager));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/workspaces/{}/instance/session/abc/message?stream=false",
                    workspace.id
                ))
                .header("content-type", "text/plain")
                .header("content-length", "5")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "fake");
    let proxied = body_bytes(response).await;

    let direct = reqwest::Client::new()
        .post(format!(
            "http://127.0.0.1:{}/session/abc/message?stream=false",
            upstream.port()
        ))
        .body("hello")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(proxied, direct.to_vec());
    assert_eq!(proxied, b"POST /session/abc/message?stream=false\nhello".to_vec());

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_encoded_subpath_is_forwarded_verbatim() {
    let upstream = FakeUpstream::start().await;
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::serving(upstream.port());
    let manager = Arc::new(instance.manager(EventBus::new()));
    let workspace = manager.create(folder.path(), None).await.unwrap();

    let (router, _) = app(Arc::clone(&manager));
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/workspaces/{}/instance/file/a%3Fb%2Fc%20d?q=x%26y",
                    workspace.id
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let proxied = body_bytes(response).await;

    let direct = reqwest::get(format!(
        "http://127.0.0.1:{}/file/a%3Fb%2Fc%20d?q=x%26y",
        upstream.port()
    ))
    .await
    .unwrap()
    .bytes()
    .await
    .unwrap();

    assert_eq!(proxied, direct.to_vec());
    assert_eq!(proxied, b"GET /file/a%3Fb%2Fc%20d?q=x%26y\n".to_vec());

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_empty_subpath_hits_instance_root() {
    let upstream = FakeUpstream::start().await;
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::serving(upstream.port());
    let manager = Arc::new(instance.manager(EventBus::new()));
    let workspace = manager.create(folder.path(), None).await.unwrap();

    let (router, _) = app(Arc::clone(&manager));
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/workspaces/{}/instance", workspace.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"GET /\n".to_vec());

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_transport_failure_is_reported() {
    let upstream = FakeUpstream::start().await;
    let folder = tempfile::tempdir().unwrap();
    let instance = FakeInstance::serving(upstream.port());
    let manager = Arc::new(instance.manager(EventBus::new()));
    let workspace = manager.create(folder.path(), None).await.unwrap();

    upstream.go_offline();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let (router, _) = app(Arc::clone(&manager));
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/workspaces/{}/instance/session", workspace.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "UPSTREAM_PROXY_FAILED");

    manager.shutdown_all().await;
}
