//! File-backed event log: one JSONL file per run

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use runway_core::Event;
use tracing::warn;

use super::{EventStore, StoreError};

/// Per-run sequence bookkeeping, lazily rebuilt from disk.
struct RunLog {
    last_seq: Option<u64>,
}

/// Append-only event store writing one JSON object per line into
/// `<data_dir>/events/<run_id>.jsonl`.
///
/// Appends for the same run serialize through a per-run mutex; appends for
/// distinct runs do not contend.
pub struct JsonlEventStore {
    base_dir: PathBuf,
    runs: Mutex<HashMap<String, Arc<Mutex<RunLog>>>>,
}

impl JsonlEventStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", base_dir.display())))?;
        Ok(Self {
            base_dir,
            runs: Mutex::new(HashMap::new()),
        })
    }

    fn event_file(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.jsonl"))
    }

    fn run_log(&self, run_id: &str) -> Arc<Mutex<RunLog>> {
        let mut runs = self.runs.lock();
        runs.entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RunLog { last_seq: None })))
            .clone()
    }

    fn scan_last_seq(path: &Path) -> Result<u64, StoreError> {
        if !path.exists() {
            return Ok(0);
        }
        let file = fs::File::open(path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        let mut last = 0u64;
        for line in BufReader::new(file).lines() {
            let line =
                line.map_err(|e| StoreError::Unavailable(format!("read {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => last = last.max(event.seq),
                Err(_) => warn!(path = %path.display(), "skipping corrupt event line"),
            }
        }
        Ok(last)
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, mut event: Event) -> Result<Event, StoreError> {
        let run_log = self.run_log(&event.run_id);
        let mut log = run_log.lock();

        let path = self.event_file(&event.run_id);
        let last = match log.last_seq {
            Some(seq) => seq,
            None => Self::scan_last_seq(&path)?,
        };
        event.seq = last + 1;

        let line = serde_json::to_string(&event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::Unavailable(format!("write {}: {e}", path.display())))?;

        log.last_seq = Some(event.seq);
        Ok(event)
    }

    async fn history(&self, run_id: &str) -> Result<Vec<Event>, StoreError> {
        let path = self.event_file(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line =
                line.map_err(|e| StoreError::Unavailable(format!("read {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(_) => warn!(%run_id, "skipping malformed event line"),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::event_types;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, JsonlEventStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlEventStore::new(dir.path().join("events")).expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_seq() {
        let (_dir, store) = store();
        for expected in 1..=5u64 {
            let stored = store
                .append(Event::new(event_types::OUTPUT_CHUNK, "run-1", json!({"text": "x"})))
                .await
                .expect("append");
            assert_eq!(stored.seq, expected);
        }
    }

    #[tokio::test]
    async fn test_seq_is_per_run() {
        let (_dir, store) = store();
        let a = store
            .append(Event::new(event_types::RUN_STARTED, "run-a", json!({})))
            .await
            .unwrap();
        let b = store
            .append(Event::new(event_types::RUN_STARTED, "run-b", json!({})))
            .await
            .unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 1);
    }

    #[tokio::test]
    async fn test_seq_recovers_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events");
        {
            let store = JsonlEventStore::new(&path).expect("store");
            store
                .append(Event::new(event_types::RUN_STARTED, "run-1", json!({})))
                .await
                .unwrap();
            store
                .append(Event::new(event_types::OUTPUT_CHUNK, "run-1", json!({})))
                .await
                .unwrap();
        }
        // Fresh store instance must continue the sequence, not restart it.
        let store = JsonlEventStore::new(&path).expect("store");
        let stored = store
            .append(Event::new(event_types::RUN_COMPLETED, "run-1", json!({})))
            .await
            .unwrap();
        assert_eq!(stored.seq, 3);
    }

    #[tokio::test]
    async fn test_history_skips_corrupt_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events");
        let store = JsonlEventStore::new(&path).expect("store");
        store
            .append(Event::new(event_types::RUN_STARTED, "run-1", json!({})))
            .await
            .unwrap();

        let file = path.join("run-1.jsonl");
        let mut content = fs::read_to_string(&file).unwrap();
        content.push_str("{not json\n");
        fs::write(&file, content).unwrap();

        let history = store.history("run-1").await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_ordered() {
        let (_dir, store) = store();
        for i in 0..4 {
            store
                .append(Event::new(
                    event_types::OUTPUT_CHUNK,
                    "run-1",
                    json!({"text": format!("{i}")}),
                ))
                .await
                .unwrap();
        }
        let history = store.history("run-1").await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
