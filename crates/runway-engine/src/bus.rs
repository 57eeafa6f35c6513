//! Event bus: persist-first publish with replay-plus-tail subscriptions
//!
//! `publish` is the only way an event enters the system. Order of effects:
//! append to the durable log (seq assigned), fold into the run snapshot,
//! enqueue durable tool work (distributed mode), then best-effort broadcast
//! to live subscribers. Broadcast failures never fail `publish` — a
//! subscriber that saw nothing can always replay.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use runway_core::{event_types, Event};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::projector::{Projector, ProjectorError};
use crate::queue::ToolQueue;
use crate::store::{EventStore, StoreError};

/// Bound for per-subscriber queues. A subscriber that falls this far behind
/// is dropped rather than blocking publishers.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Errors surfaced by [`EventBus::publish`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The snapshot write-through failed after the event was made durable.
    /// Callers treat this as fatal; recovery rebuilds the snapshot from the
    /// log.
    #[error(transparent)]
    Projection(#[from] ProjectorError),
}

/// Live fan-out half of the bus. Durability is the store's job; transports
/// only move already-persisted events to subscribers.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Best-effort delivery to current subscribers.
    async fn broadcast(&self, event: &Event);

    /// Live events for one run, from this moment on.
    fn subscribe(&self, run_id: &str) -> mpsc::Receiver<Event>;

    /// Live events for every run.
    fn subscribe_all(&self) -> mpsc::Receiver<Event>;
}

// =============================================================================
// Local transport
// =============================================================================

struct Registry {
    by_run: HashMap<String, Vec<mpsc::Sender<Event>>>,
    global: Vec<mpsc::Sender<Event>>,
}

/// In-process fan-out with bounded per-subscriber queues.
pub struct LocalTransport {
    registry: Mutex<Registry>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                by_run: HashMap::new(),
                global: Vec::new(),
            }),
        }
    }

    /// Deliver to one subscriber; returns false when it should be dropped.
    fn deliver(sender: &mpsc::Sender<Event>, event: &Event) -> bool {
        match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Overflow: try to leave a marker, then drop the subscriber.
                let marker = Event::new(
                    event_types::ERROR_RAISED,
                    event.run_id.clone(),
                    json!({"reason": "subscriber_overflow"}),
                );
                let _ = sender.try_send(marker);
                warn!(run_id = %event.run_id, "dropping slow event subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for LocalTransport {
    async fn broadcast(&self, event: &Event) {
        let mut registry = self.registry.lock();
        if let Some(subscribers) = registry.by_run.get_mut(&event.run_id) {
            subscribers.retain(|sender| Self::deliver(sender, event));
            if subscribers.is_empty() {
                registry.by_run.remove(&event.run_id);
            }
        }
        registry.global.retain(|sender| Self::deliver(sender, event));
    }

    fn subscribe(&self, run_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.registry
            .lock()
            .by_run
            .entry(run_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY * 4);
        self.registry.lock().global.push(tx);
        rx
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Persist-first event bus shared by the coordinator, engine, activities,
/// and executor.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn EventTransport>,
    projector: Arc<Projector>,
    tool_queue: Option<Arc<dyn ToolQueue>>,
}

impl EventBus {
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn EventTransport>,
        projector: Arc<Projector>,
    ) -> Self {
        Self {
            store,
            transport,
            projector,
            tool_queue: None,
        }
    }

    /// Route `tool.requested` events through a durable queue after persist
    /// (distributed mode).
    pub fn with_tool_queue(mut self, queue: Arc<dyn ToolQueue>) -> Self {
        self.tool_queue = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    /// Persist, project, and broadcast an event. Returns the stored copy
    /// with its assigned `seq`.
    pub async fn publish(&self, event: Event) -> Result<Event, PublishError> {
        let stored = self.store.append(event).await?;
        self.projector.apply(&stored).await?;

        if stored.event_type == event_types::TOOL_REQUESTED {
            if let Some(queue) = &self.tool_queue {
                if let Err(error) = queue.enqueue(&stored).await {
                    // The event is durable; a queue hiccup is recoverable by
                    // re-driving the run, so it must not fail the publish.
                    warn!(run_id = %stored.run_id, %error, "tool queue enqueue failed");
                }
            }
        }

        self.transport.broadcast(&stored).await;
        Ok(stored)
    }

    /// Full history followed seamlessly by live events.
    ///
    /// The live registration happens before the history read, so the overlap
    /// window is deduplicated by `seq`. The stream ends after a terminal
    /// event.
    pub async fn subscribe(&self, run_id: &str) -> Result<mpsc::Receiver<Event>, StoreError> {
        let live = self.transport.subscribe(run_id);
        let history = self.store.history(run_id).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        tokio::spawn(replay_then_tail(history, live, tx));
        Ok(rx)
    }

    /// Live events for every run; used by the engine and the local executor.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.transport.subscribe_all()
    }
}

async fn replay_then_tail(
    history: Vec<Event>,
    mut live: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
) {
    let mut last_seq = 0u64;
    let mut saw_terminal = false;

    for event in history {
        last_seq = last_seq.max(event.seq);
        saw_terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            return;
        }
    }
    if saw_terminal {
        return;
    }

    while let Some(event) = live.recv().await {
        // seq == 0 marks synthetic, non-persisted signals (overflow marker).
        if event.seq != 0 && event.seq <= last_seq {
            continue;
        }
        last_seq = last_seq.max(event.seq);
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            return;
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshots::JsonStateStore;
    use crate::store::JsonlEventStore;
    use serde_json::json;

    fn bus(dir: &tempfile::TempDir) -> EventBus {
        let store: Arc<dyn EventStore> =
            Arc::new(JsonlEventStore::new(dir.path().join("events")).expect("store"));
        let state_store = Arc::new(JsonStateStore::new(dir.path().join("state")).expect("states"));
        let projector = Arc::new(Projector::new(store.clone(), state_store));
        EventBus::new(store, Arc::new(LocalTransport::new()), projector)
    }

    #[tokio::test]
    async fn test_publish_assigns_seq_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(&dir);

        let mut rx = bus.subscribe("run-1").await.expect("subscribe");
        let stored = bus
            .publish(Event::new(
                event_types::RUN_STARTED,
                "run-1",
                json!({"message": "hi", "mode": "answer"}),
            ))
            .await
            .expect("publish");
        assert_eq!(stored.seq, 1);

        let received = rx.recv().await.expect("event");
        assert_eq!(received.seq, 1);
        assert_eq!(received.event_type, event_types::RUN_STARTED);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_then_tails() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(&dir);

        for i in 0..3 {
            bus.publish(Event::new(
                event_types::OUTPUT_CHUNK,
                "run-1",
                json!({"text": format!("{i}")}),
            ))
            .await
            .unwrap();
        }

        let mut rx = bus.subscribe("run-1").await.expect("subscribe");
        for expected in 1..=3u64 {
            assert_eq!(rx.recv().await.expect("replay").seq, expected);
        }

        bus.publish(Event::new(event_types::RUN_COMPLETED, "run-1", json!({})))
            .await
            .unwrap();
        let live = rx.recv().await.expect("live");
        assert_eq!(live.seq, 4);
        // Terminal event closes the stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_after_terminal_gets_history_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(&dir);

        bus.publish(Event::new(
            event_types::RUN_STARTED,
            "run-1",
            json!({"message": "hi", "mode": "answer"}),
        ))
        .await
        .unwrap();
        bus.publish(Event::new(event_types::RUN_FAILED, "run-1", json!({})))
            .await
            .unwrap();

        let mut rx = bus.subscribe("run-1").await.expect("subscribe");
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_events_ordered_per_run_across_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(bus(&dir));

        let mut rx = bus.subscribe("run-1").await.expect("subscribe");
        for i in 0..10 {
            bus.publish(Event::new(
                event_types::OUTPUT_CHUNK,
                "run-1",
                json!({"text": format!("{i}")}),
            ))
            .await
            .unwrap();
        }
        let mut last = 0;
        for _ in 0..10 {
            let event = rx.recv().await.unwrap();
            assert!(event.seq > last, "seq must strictly increase");
            last = event.seq;
        }
    }
}
