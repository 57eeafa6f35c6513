//! Snapshot persistence for run and workflow state
//!
//! Both stores hold one JSON document per run. Writes are atomic (temp file
//! plus rename) so readers never observe a partially written record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use runway_core::{RunState, WorkflowState};
use tracing::warn;

/// Errors from snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence for [`RunState`] snapshots.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn save(&self, state: &RunState) -> Result<(), SnapshotError>;
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, SnapshotError>;
}

/// Persistence for [`WorkflowState`] records.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    async fn save(&self, state: &WorkflowState) -> Result<(), SnapshotError>;
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, SnapshotError>;

    /// Workflows that have not reached a terminal status; consulted at
    /// process start so orphaned runs resume.
    async fn list_incomplete(&self) -> Result<Vec<WorkflowState>, SnapshotError>;
}

/// Write `content` to `path` via a temp file and rename.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("snapshot"),
        std::process::id(),
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

// =============================================================================
// File-backed implementations
// =============================================================================

/// [`RunState`] snapshots as `<dir>/<run_id>.json` documents.
pub struct JsonStateStore {
    base_dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| SnapshotError::Unavailable(format!("create {}: {e}", base_dir.display())))?;
        Ok(Self { base_dir })
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn save(&self, state: &RunState) -> Result<(), SnapshotError> {
        let payload = serde_json::to_vec_pretty(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        atomic_write(&self.path(&state.run_id), &payload)
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>, SnapshotError> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(_) => {
                warn!(%run_id, "discarding unreadable run snapshot");
                Ok(None)
            }
        }
    }
}

/// [`WorkflowState`] records as `<dir>/<run_id>.json` documents.
pub struct JsonWorkflowStore {
    base_dir: PathBuf,
}

impl JsonWorkflowStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| SnapshotError::Unavailable(format!("create {}: {e}", base_dir.display())))?;
        Ok(Self { base_dir })
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl WorkflowStore for JsonWorkflowStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), SnapshotError> {
        let payload = serde_json::to_vec_pretty(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        atomic_write(&self.path(&state.run_id), &payload)
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, SnapshotError> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(_) => {
                warn!(%run_id, "discarding unreadable workflow record");
                Ok(None)
            }
        }
    }

    async fn list_incomplete(&self) -> Result<Vec<WorkflowState>, SnapshotError> {
        let mut incomplete = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            if let Ok(state) = serde_json::from_slice::<WorkflowState>(&raw) {
                if !state.is_terminal() {
                    incomplete.push(state);
                }
            }
        }
        incomplete.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::Step;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();

        let mut state = RunState::empty("run-1");
        state.message = "hello".to_string();
        store.save(&state).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().expect("snapshot");
        assert_eq!(loaded, state);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_incomplete_skips_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonWorkflowStore::new(dir.path()).unwrap();

        let running = WorkflowState::new("run-running");
        store.save(&running).await.unwrap();

        let mut done = WorkflowState::new("run-done");
        done.mark_completed();
        store.save(&done).await.unwrap();

        let mut failed = WorkflowState::new("run-failed");
        failed.mark_failed(json!({"error": "x"}));
        store.save(&failed).await.unwrap();

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].run_id, "run-running");
    }

    #[tokio::test]
    async fn test_workflow_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonWorkflowStore::new(dir.path()).unwrap();

        let mut state = WorkflowState::new("run-1");
        state.record_attempt(Step::Receive);
        state.advance_to(Step::Plan);
        store.save(&state).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().expect("record");
        assert_eq!(loaded, state);
    }
}
