//! Snapshot repository trait definition.
//!
//! Defines the storage interface for run snapshots. The infrastructure layer
//! (stepwise-infra) implements this trait with SQLite persistence; an
//! in-memory implementation lives here for embedding and tests.

use std::sync::Arc;

use dashmap::DashMap;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::Snapshot;
use uuid::Uuid;

/// Repository trait for run snapshot persistence.
///
/// Snapshots are keyed by `(workflow_name, run_id)`; writing the same key
/// twice replaces the earlier snapshot.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SnapshotRepository: Send + Sync {
    /// Upsert the snapshot for a run.
    fn persist_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
        snapshot: &Snapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the latest snapshot for a run.
    fn load_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Snapshot>, RepositoryError>> + Send;

    /// List run IDs that have a snapshot for the given workflow.
    fn list_runs(
        &self,
        workflow_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Delete a run's snapshot. Returns `true` if it existed.
    fn delete_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemorySnapshotStore
// ---------------------------------------------------------------------------

/// `DashMap`-backed snapshot store.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<DashMap<(String, Uuid), Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots across all workflows.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotRepository for InMemorySnapshotStore {
    async fn persist_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
        snapshot: &Snapshot,
    ) -> Result<(), RepositoryError> {
        self.snapshots
            .insert((workflow_name.to_string(), *run_id), snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> Result<Option<Snapshot>, RepositoryError> {
        Ok(self
            .snapshots
            .get(&(workflow_name.to_string(), *run_id))
            .map(|entry| entry.value().clone()))
    }

    async fn list_runs(&self, workflow_name: &str) -> Result<Vec<Uuid>, RepositoryError> {
        let mut runs: Vec<Uuid> = self
            .snapshots
            .iter()
            .filter(|entry| entry.key().0 == workflow_name)
            .map(|entry| entry.key().1)
            .collect();
        runs.sort();
        Ok(runs)
    }

    async fn delete_snapshot(
        &self,
        workflow_name: &str,
        run_id: &Uuid,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .snapshots
            .remove(&(workflow_name.to_string(), *run_id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use stepwise_types::workflow::{StepResult, WorkflowContext};

    fn snapshot_with(step: &str, output: serde_json::Value) -> Snapshot {
        let mut ctx = WorkflowContext::new(json!({}));
        ctx.steps
            .insert(step.to_string(), StepResult::Success { output });
        Snapshot::new(BTreeMap::new(), ctx)
    }

    #[tokio::test]
    async fn persisting_twice_overwrites() {
        let store = InMemorySnapshotStore::new();
        let run_id = Uuid::now_v7();

        store
            .persist_snapshot("wf", &run_id, &snapshot_with("a", json!(1)))
            .await
            .unwrap();
        store
            .persist_snapshot("wf", &run_id, &snapshot_with("a", json!(2)))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load_snapshot("wf", &run_id).await.unwrap().unwrap();
        assert_eq!(loaded.context.step_output("a"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn snapshots_are_scoped_by_workflow_name() {
        let store = InMemorySnapshotStore::new();
        let run_id = Uuid::now_v7();
        store
            .persist_snapshot("one", &run_id, &snapshot_with("a", json!(1)))
            .await
            .unwrap();

        assert!(store.load_snapshot("two", &run_id).await.unwrap().is_none());
        assert_eq!(store.list_runs("one").await.unwrap(), vec![run_id]);
        assert!(store.list_runs("two").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemorySnapshotStore::new();
        let run_id = Uuid::now_v7();
        store
            .persist_snapshot("wf", &run_id, &snapshot_with("a", json!(1)))
            .await
            .unwrap();

        assert!(store.delete_snapshot("wf", &run_id).await.unwrap());
        assert!(!store.delete_snapshot("wf", &run_id).await.unwrap());
        assert!(store.is_empty());
    }
}
