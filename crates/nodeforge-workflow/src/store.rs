//! Workflow state storage
//!
//! A [`WorkflowSnapshot`] saved after `setup` is what lets a later
//! `teardown` process undo exactly what that run changed.

use crate::error::WorkflowError;
use crate::workflow::WorkflowSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

pub type StoreResult<T> = std::result::Result<T, WorkflowError>;

/// Trait for snapshot persistence, keyed by workflow id
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the snapshot for a workflow
    async fn load(&self, workflow: &str) -> StoreResult<Option<WorkflowSnapshot>>;

    /// Save a snapshot, replacing any previous one for the same workflow
    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()>;

    /// Delete the snapshot for a workflow; missing snapshots are not an error
    async fn delete(&self, workflow: &str) -> StoreResult<()>;
}

/// In-memory state store for testing
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<HashMap<String, WorkflowSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, workflow: &str) -> StoreResult<Option<WorkflowSnapshot>> {
        Ok(self.snapshots.read().await.get(workflow).cloned())
    }

    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.workflow.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, workflow: &str) -> StoreResult<()> {
        self.snapshots.write().await.remove(workflow);
        Ok(())
    }
}

/// Stores one JSON file per workflow under a directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow: &str) -> StoreResult<PathBuf> {
        if workflow.is_empty()
            || workflow.contains(['/', '\\'])
            || workflow.starts_with('.')
        {
            return Err(WorkflowError::StateStore(format!(
                "invalid workflow id for a state file: '{}'",
                workflow
            )));
        }
        Ok(self.dir.join(format!("{}.json", workflow)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, workflow: &str) -> StoreResult<Option<WorkflowSnapshot>> {
        let path = self.path_for(workflow)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()> {
        let path = self.path_for(&snapshot.workflow)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // rename over the old file; readers never see a partial snapshot
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Saved workflow snapshot");
        Ok(())
    }

    async fn delete(&self, workflow: &str) -> StoreResult<()> {
        let path = self.path_for(workflow)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepState;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn snapshot(workflow: &str) -> WorkflowSnapshot {
        let mut state = StepState::new();
        state.set("alreadyLoaded", false);
        state.set("loadedByThisStep", true);
        WorkflowSnapshot {
            workflow: workflow.to_string(),
            created_at: Utc::now(),
            executed: BTreeMap::from([(workflow.to_string(), 1)]),
            states: BTreeMap::from([(format!("{}/overlay", workflow), state)]),
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load("setup-kernel-modules").await.unwrap().is_none());

        let snap = snapshot("setup-kernel-modules");
        store.save(&snap).await.unwrap();
        assert_eq!(store.load("setup-kernel-modules").await.unwrap(), Some(snap));

        store.delete("setup-kernel-modules").await.unwrap();
        assert!(store.load("setup-kernel-modules").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));

        let snap = snapshot("setup-kubelet");
        store.save(&snap).await.unwrap();
        assert!(dir.path().join("state/setup-kubelet.json").exists());
        assert!(!dir.path().join("state/setup-kubelet.json.tmp").exists());

        let loaded = store.load("setup-kubelet").await.unwrap().unwrap();
        assert_eq!(loaded, snap);

        store.delete("setup-kubelet").await.unwrap();
        store.delete("setup-kubelet").await.unwrap();
        assert!(store.load("setup-kubelet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(WorkflowError::StateStore(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_snapshot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("all.json"), b"{not json").unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(matches!(
            store.load("all").await,
            Err(WorkflowError::Serialization(_))
        ));
    }
}
