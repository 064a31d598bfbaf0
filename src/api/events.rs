//! Live event stream
//!
//! `GET /api/events` re-emits every bus event as a server-sent event named
//! after its tag, with the JSON event as `data`. `?workspace=<id>` narrows the
//! stream to one workspace. Streams end once shutdown starts draining so the
//! server can close its connections.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use harbor_core::ShutdownController;
use harbor_events::{EventBus, EventStream, WorkspaceEvent};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub workspace: Option<String>,
}

fn to_sse(event: &WorkspaceEvent) -> Event {
    let sse = Event::default().event(event.kind().as_str());
    match serde_json::to_string(event) {
        Ok(json) => sse.data(json),
        Err(e) => {
            warn!(error = %e, kind = %event.kind(), "Failed to serialize event");
            Event::default().comment("unserializable event")
        }
    }
}

/// Stream of bus events matching `workspace`.
///
/// Ends when `until` is cancelled or the bus is dropped.
pub fn event_stream(
    events: EventStream,
    workspace: Option<String>,
    until: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((events, workspace), |(mut events, workspace)| async move {
        loop {
            let event = events.recv().await?;
            if workspace
                .as_deref()
                .is_some_and(|id| event.workspace_id() != id)
            {
                continue;
            }
            return Some((Ok(to_sse(&event)), (events, workspace)));
        }
    })
    .take_until(until.cancelled_owned())
}

async fn stream_events(
    Extension(bus): Extension<EventBus>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(workspace = ?query.workspace, "Event stream client connected");
    let events = event_stream(bus.stream(), query.workspace, shutdown.token());
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Event stream routes
pub fn events_routes() -> Router {
    Router::new().route("/api/events", get(stream_events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_events::{LogEntry, LogLevel};

    fn log(id: &str, message: &str) -> WorkspaceEvent {
        WorkspaceEvent::WorkspaceLog {
            entry: LogEntry::new(id, LogLevel::Info, message),
        }
    }

    #[tokio::test]
    async fn test_stream_filters_by_workspace() {
        let bus = EventBus::new();
        let stream = event_stream(
            bus.stream(),
            Some("w2".to_string()),
            CancellationToken::new(),
        );
        futures::pin_mut!(stream);

        bus.publish(log("w1", "ignored"));
        bus.publish(log("w2", "kept"));

        let next = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_some());
        assert!(futures::FutureExt::now_or_never(stream.next()).is_none());
    }

    #[test]
    fn test_stream_unsubscribes_on_drop() {
        let bus = EventBus::new();
        let stream = event_stream(bus.stream(), None, CancellationToken::new());
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_when_cancelled() {
        let bus = EventBus::new();
        let token = CancellationToken::new();
        let stream = event_stream(bus.stream(), None, token.clone());
        futures::pin_mut!(stream);

        bus.publish(log("w1", "before"));
        let first = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(first.is_some());

        token.cancel();
        bus.publish(log("w1", "after"));
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
