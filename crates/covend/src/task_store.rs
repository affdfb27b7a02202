//! The task store contract (spec Section 6.3), implemented against the
//! same SQLite pool as the rest of daemon state rather than consumed from
//! an external service — this binary runs standalone.
//!
//! `subscribe()` from the spec's operation list is not a separate method
//! here: task transitions are already published as `task.created`,
//! `task.updated`, and `task.closed` events on the shared
//! [`crate::event_bus::EventBus`], so a caller subscribes to the Event Bus
//! and filters by kind instead of a second channel.

use coven_core::{Id, Task, TaskStatus};

use crate::storage::{Storage, StorageError};

/// Outcome of an attempted claim (spec Section 6.3: `ok | already_claimed |
/// not_claimable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Operations the scheduler and RPC surface need from the task store
/// (spec Section 6.3). `Storage` is the only implementation; the trait
/// exists so the contract is checked at the type level rather than only
/// documented.
pub trait TaskStore: Send + Sync {
    async fn list_ready(&self) -> Result<Vec<Task>>;
    async fn get(&self, task_id: &Id) -> Result<Task>;
    async fn claim(&self, task_id: &Id, claimant: &str) -> Result<ClaimOutcome>;
    async fn release(&self, task_id: &Id, claimant: &str) -> Result<()>;
    async fn set_status(&self, task_id: &Id, status: TaskStatus) -> Result<()>;
}

impl TaskStore for Storage {
    async fn list_ready(&self) -> Result<Vec<Task>> {
        self.list_eligible_tasks().await
    }

    async fn get(&self, task_id: &Id) -> Result<Task> {
        self.get_task(task_id).await
    }

    async fn claim(&self, task_id: &Id, claimant: &str) -> Result<ClaimOutcome> {
        match self.claim_task(task_id, claimant).await {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(StorageError::ClaimRace(_)) => Ok(ClaimOutcome::AlreadyClaimed),
            Err(e) => Err(e),
        }
    }

    /// Release ignores a claimant mismatch: by the time a release is
    /// requested (cancellation, failure) the caller already owns the only
    /// reference to the claim.
    async fn release(&self, task_id: &Id, _claimant: &str) -> Result<()> {
        self.release_claim(task_id).await
    }

    async fn set_status(&self, task_id: &Id, status: TaskStatus) -> Result<()> {
        self.update_task_status(task_id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (dir, storage)
    }

    fn sample_task() -> Task {
        Task {
            id: Id::new(),
            title: "do a thing".to_string(),
            body: String::new(),
            task_type: coven_core::TaskType::Feature,
            priority: 2,
            labels: vec![],
            status: TaskStatus::Open,
            claimed_by: None,
            parent_id: None,
            dependencies: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_then_claim_again_is_already_claimed() {
        let (_dir, storage) = test_store().await;
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();

        let first = TaskStore::claim(&storage, &task.id, "claimant-a").await.unwrap();
        assert_eq!(first, ClaimOutcome::Claimed);

        let second = TaskStore::claim(&storage, &task.id, "claimant-b").await.unwrap();
        assert_eq!(second, ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn list_ready_excludes_claimed_tasks() {
        let (_dir, storage) = test_store().await;
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();

        assert_eq!(TaskStore::list_ready(&storage).await.unwrap().len(), 1);
        TaskStore::claim(&storage, &task.id, "claimant-a").await.unwrap();
        assert_eq!(TaskStore::list_ready(&storage).await.unwrap().len(), 0);
    }
}
