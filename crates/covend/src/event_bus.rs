//! Event Bus (C5): a broadcast channel backing SSE subscribers, fed by a
//! periodic heartbeat and by every workflow/task transition (spec Section
//! 4.5, 6.2).

use coven_core::{Event, EventKind, Id};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::storage::Storage;

/// Slow subscribers are dropped from the broadcast, not the publisher
/// (spec Section 4.5: back-pressure never blocks workflow progress).
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    storage: Arc<Storage>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(storage: Arc<Storage>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { storage, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Persist the event, then broadcast it. Persistence happens first so a
    /// subscriber that reconnects via `list_events_since` never misses a
    /// published event.
    pub async fn publish(&self, event: Event) -> crate::storage::Result<()> {
        self.storage.insert_event(&event).await?;
        let _ = self.sender.send(event);
        Ok(())
    }

    pub async fn publish_workflow(
        &self,
        kind: EventKind,
        workflow_id: &Id,
        task_id: &Id,
        payload: impl serde::Serialize,
    ) -> crate::storage::Result<()> {
        let event = Event::new(kind, 0, payload)
            .expect("event payload always serializes")
            .with_workflow(workflow_id.clone())
            .with_task(task_id.clone());
        self.publish(event).await
    }

    pub async fn publish_task(
        &self,
        kind: EventKind,
        task_id: &Id,
        payload: impl serde::Serialize,
    ) -> crate::storage::Result<()> {
        let event =
            Event::new(kind, 0, payload).expect("event payload always serializes").with_task(task_id.clone());
        self.publish(event).await
    }

    /// Spawn the background heartbeat loop. Runs until the returned handle
    /// is aborted (the daemon aborts it on shutdown).
    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let event = Event::new(EventKind::Heartbeat, 0, serde_json::json!({}))
                    .expect("heartbeat payload always serializes");
                if self.publish(event).await.is_err() {
                    tracing::warn!("failed to persist heartbeat event");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_bus() -> (TempDir, EventBus) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (dir, EventBus::new(Arc::new(storage)))
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let (_dir, bus) = test_bus().await;
        let mut rx = bus.subscribe();

        let task_id = Id::new();
        bus.publish_task(EventKind::TaskCreated, &task_id, serde_json::json!({})).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::TaskCreated);
        assert_eq!(event.task_id, Some(task_id));
    }

    #[tokio::test]
    async fn published_events_are_durable() {
        let (_dir, bus) = test_bus().await;
        let workflow_id = Id::new();
        let task_id = Id::new();
        bus.publish_workflow(EventKind::WorkflowStarted, &workflow_id, &task_id, serde_json::json!({}))
            .await
            .unwrap();

        let replayed = bus.storage.list_events_since(0).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].workflow_id, Some(workflow_id));
    }
}
