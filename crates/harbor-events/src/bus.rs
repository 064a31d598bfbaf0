use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

/// Events an [`EventStream`] queues before it starts dropping.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

use crate::types::{EventKind, WorkspaceEvent};

type Handler = Arc<dyn Fn(&WorkspaceEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` subscribes to every event
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| s.id != id);
    }
}

/// Synchronous, typed publish/subscribe hub.
///
/// One bus is constructed per running system and passed down explicitly;
/// cloning shares the same subscriber list. `publish` invokes every matching
/// subscriber in registration order on the caller's task. A panicking
/// subscriber is logged and skipped so later subscribers still receive the
/// event. There is no buffering and no replay.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&WorkspaceEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Subscribe to a single event tag.
    pub fn subscribe_to<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&WorkspaceEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event through a channel holding up to
    /// [`DEFAULT_STREAM_CAPACITY`] events.
    ///
    /// Unsubscribes when the returned stream is dropped.
    pub fn stream(&self) -> EventStream {
        self.stream_with_capacity(DEFAULT_STREAM_CAPACITY)
    }

    /// Subscribe to every event through a channel holding up to `capacity`
    /// events. While the queue is full new events are dropped for this
    /// stream only and counted in [`EventStream::dropped`].
    pub fn stream_with_capacity(&self, capacity: usize) -> EventStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let lagging = AtomicBool::new(false);
        let counter = Arc::clone(&dropped);
        let subscription = self.subscribe(move |event| match tx.try_send(event.clone()) {
            Ok(()) => {
                if lagging.swap(false, Ordering::Relaxed) {
                    warn!(
                        dropped = counter.load(Ordering::Relaxed),
                        "Event stream consumer caught up"
                    );
                }
            }
            Err(TrySendError::Full(_)) => {
                counter.fetch_add(1, Ordering::Relaxed);
                if !lagging.swap(true, Ordering::Relaxed) {
                    warn!(capacity, "Event stream consumer lagging, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        });
        EventStream {
            rx,
            dropped,
            subscription,
        }
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, kind, handler });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber registered right now.
    ///
    /// Returns the number of subscribers that handled it without panicking.
    pub fn publish(&self, event: WorkspaceEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<Handler> = {
            let subscribers = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = %kind, "Event subscriber panicked"),
            }
        }
        delivered
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Handle returned by `subscribe`; `unsubscribe` is idempotent.
///
/// Dropping the handle does NOT unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the subscriber. Safe to call more than once, or after the bus
    /// is gone.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Channel-backed subscription to every event.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<WorkspaceEvent>,
    dropped: Arc<AtomicU64>,
    subscription: Subscription,
}

impl EventStream {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<WorkspaceEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<WorkspaceEvent> {
        self.rx.try_recv().ok()
    }

    /// Events discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
