//! Run state projector
//!
//! Folds each persisted event into the run's snapshot and writes the
//! snapshot through on every change, so API reads are O(1). A missing or
//! stale snapshot is rebuilt by replaying the event log; the projector
//! verifies sequence continuity and falls back to a full replay whenever a
//! gap is observed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use runway_core::{projection, Event, RunState};
use tokio::sync::Mutex as AsyncMutex;

use crate::snapshots::{SnapshotError, StateStore};
use crate::store::{EventStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

struct Entry {
    last_seq: u64,
    state: RunState,
}

/// Materializes [`RunState`] snapshots from the event stream.
pub struct Projector {
    event_store: Arc<dyn EventStore>,
    state_store: Arc<dyn StateStore>,
    entries: Mutex<HashMap<String, Arc<AsyncMutex<Option<Entry>>>>>,
}

impl Projector {
    pub fn new(event_store: Arc<dyn EventStore>, state_store: Arc<dyn StateStore>) -> Self {
        Self {
            event_store,
            state_store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, run_id: &str) -> Arc<AsyncMutex<Option<Entry>>> {
        let mut entries = self.entries.lock();
        entries
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Fold a persisted event into the snapshot and write it through.
    pub async fn apply(&self, event: &Event) -> Result<RunState, ProjectorError> {
        let slot = self.entry(&event.run_id);
        let mut guard = slot.lock().await;

        let needs_rebuild = match guard.as_ref() {
            Some(entry) => event.seq != entry.last_seq + 1,
            None => true,
        };

        if needs_rebuild {
            let history = self.event_store.history(&event.run_id).await?;
            let last_seq = history.last().map(|e| e.seq).unwrap_or(0);
            let state = projection::project(&event.run_id, &history);
            *guard = Some(Entry { last_seq, state });
        } else if let Some(entry) = guard.as_mut() {
            projection::apply_event(&mut entry.state, event);
            entry.last_seq = event.seq;
        }

        let entry = guard.as_ref().ok_or_else(|| {
            ProjectorError::Snapshot(SnapshotError::Unavailable(
                "projection entry missing after rebuild".to_string(),
            ))
        })?;
        self.state_store.save(&entry.state).await?;
        Ok(entry.state.clone())
    }

    /// Current snapshot for a run, rebuilding from the log when the cached
    /// or persisted copy is missing.
    pub async fn load(&self, run_id: &str) -> Result<Option<RunState>, ProjectorError> {
        let slot = self.entry(run_id);
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            return Ok(Some(entry.state.clone()));
        }

        let history = self.event_store.history(run_id).await?;
        if history.is_empty() {
            // Nothing logged yet; fall back to whatever snapshot exists.
            return Ok(self.state_store.load(run_id).await?);
        }
        let last_seq = history.last().map(|e| e.seq).unwrap_or(0);
        let state = projection::project(run_id, &history);
        self.state_store.save(&state).await?;
        *guard = Some(Entry { last_seq, state });
        Ok(guard.as_ref().map(|e| e.state.clone()))
    }

    /// Drop the in-memory entry for a finished run.
    pub fn evict(&self, run_id: &str) {
        self.entries.lock().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshots::JsonStateStore;
    use crate::store::JsonlEventStore;
    use runway_core::event_types;
    use serde_json::json;

    async fn setup(dir: &tempfile::TempDir) -> (Arc<dyn EventStore>, Projector) {
        let event_store: Arc<dyn EventStore> =
            Arc::new(JsonlEventStore::new(dir.path().join("events")).unwrap());
        let state_store = Arc::new(JsonStateStore::new(dir.path().join("state")).unwrap());
        let projector = Projector::new(event_store.clone(), state_store);
        (event_store, projector)
    }

    #[tokio::test]
    async fn test_incremental_fold_matches_full_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (event_store, projector) = setup(&dir).await;

        let events = vec![
            Event::new(
                event_types::RUN_STARTED,
                "run-1",
                json!({"message": "hi?", "mode": "answer"}),
            ),
            Event::new(event_types::NODE_STARTED, "run-1", json!({"name": "plan"})),
            Event::new(event_types::OUTPUT_CHUNK, "run-1", json!({"text": "a"})),
            Event::new(event_types::RUN_COMPLETED, "run-1", json!({})),
        ];

        let mut incremental = RunState::empty("run-1");
        for event in events {
            let stored = event_store.append(event).await.unwrap();
            incremental = projector.apply(&stored).await.unwrap();
        }

        let history = event_store.history("run-1").await.unwrap();
        let replayed = projection::project("run-1", &history);
        assert_eq!(incremental, replayed);
    }

    #[tokio::test]
    async fn test_load_rebuilds_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (event_store, projector) = setup(&dir).await;

        // Events persisted without the projector observing them, as after a
        // crash between append and write-through.
        event_store
            .append(Event::new(
                event_types::RUN_STARTED,
                "run-1",
                json!({"message": "hello", "mode": "answer"}),
            ))
            .await
            .unwrap();
        event_store
            .append(Event::new(
                event_types::OUTPUT_CHUNK,
                "run-1",
                json!({"text": "answer"}),
            ))
            .await
            .unwrap();

        let state = projector.load("run-1").await.unwrap().expect("state");
        assert_eq!(state.message, "hello");
        assert_eq!(state.output_text, "answer");
    }

    #[tokio::test]
    async fn test_gap_triggers_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (event_store, projector) = setup(&dir).await;

        let first = event_store
            .append(Event::new(
                event_types::RUN_STARTED,
                "run-1",
                json!({"message": "hello", "mode": "answer"}),
            ))
            .await
            .unwrap();
        projector.apply(&first).await.unwrap();

        // Skip feeding the second event; applying the third must trigger a
        // full replay instead of folding onto a stale prefix.
        event_store
            .append(Event::new(event_types::OUTPUT_CHUNK, "run-1", json!({"text": "a"})))
            .await
            .unwrap();
        let third = event_store
            .append(Event::new(event_types::OUTPUT_CHUNK, "run-1", json!({"text": "b"})))
            .await
            .unwrap();

        let state = projector.apply(&third).await.unwrap();
        assert_eq!(state.output_text, "ab");
    }
}
