//! Run checkpoints for resumption.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::state::RunState;
use crate::error::StoreError;
use crate::persistence::{atomic_write_json, load_json, store_error};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored state for `state.run_id`.
    async fn save(&self, state: &RunState) -> Result<(), StoreError>;

    async fn load(&self, run_id: Uuid) -> Result<Option<RunState>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: Mutex<HashMap<Uuid, RunState>>,
    saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves so far, across all runs.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        self.runs.lock().await.insert(state.run_id, state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunState>, StoreError> {
        Ok(self.runs.lock().await.get(&run_id).cloned())
    }
}

/// Stores each run as `<dir>/<run_id>.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.path(state.run_id);
        atomic_write_json(&path, state).map_err(|e| store_error(&path, e))
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunState>, StoreError> {
        let path = self.path(run_id);
        load_json(&path).map_err(|e| store_error(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BriefRequest;

    #[tokio::test]
    async fn test_file_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let state = RunState::new(BriefRequest::new("remote work"));

        store.save(&state).await.unwrap();
        let loaded = store.load(state.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_counts_saves() {
        let store = InMemoryCheckpointStore::new();
        let mut state = RunState::new(BriefRequest::new("q"));
        store.save(&state).await.unwrap();
        state.retry_count = 1;
        store.save(&state).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load(state.run_id).await.unwrap().unwrap().retry_count, 1);
    }
}
