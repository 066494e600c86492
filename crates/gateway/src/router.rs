//! Task router - bridges external task requests to a specific node's session
//!
//! Submission never queues across node downtime: an unreachable node fails
//! the call synchronously with `NodeOffline` and the caller decides whether
//! to retry. Task status transitions are driven solely by frames from the
//! owning node's session; terminal states are final.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_core::protocol::{GatewayFrame, TaskEvent, TaskOptions};
use fleet_core::task::{Task, TaskStatus};
use fleet_core::{Error, Result};

use crate::records::RecordStore;
use crate::registry::ConnectionRegistry;

/// Task event fanned out to subscribers (the relay to the web backend)
#[derive(Debug, Clone)]
pub struct TaskBroadcast {
    pub task_id: Uuid,
    pub node_id: String,
    pub event: TaskEvent,
}

pub struct TaskRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    event_tx: broadcast::Sender<TaskBroadcast>,
}

impl TaskRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn RecordStore>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            registry,
            store,
            event_tx,
        }
    }

    /// Subscribe to task progress events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskBroadcast> {
        self.event_tx.subscribe()
    }

    /// Submit a task to a node
    ///
    /// Fails with `NodeOffline` when no live session exists; nothing is
    /// queued for later delivery. The task is recorded as pending in the
    /// durable store *before* the frame is sent, so a crash immediately after
    /// send still leaves a recoverable record.
    pub async fn submit(
        &self,
        node_id: &str,
        goal: impl Into<String>,
        options: TaskOptions,
    ) -> Result<Task> {
        let session = self
            .registry
            .lookup(node_id)
            .await
            .ok_or_else(|| Error::NodeOffline(node_id.to_string()))?;

        let task = Task::new(goal, node_id);
        self.store.put_task(task.clone()).await?;

        session
            .send(GatewayFrame::TaskSubmit {
                task_id: task.id,
                goal: task.goal.clone(),
                options,
            })
            .await?;

        info!("Task {} dispatched to node {}", task.id, node_id);
        Ok(task)
    }

    /// Request a stop for a running task
    ///
    /// If the node is unreachable this reports failure rather than silently
    /// succeeding.
    pub async fn stop(&self, node_id: &str, task_id: Uuid) -> Result<()> {
        let session = self
            .registry
            .lookup(node_id)
            .await
            .ok_or_else(|| Error::NodeOffline(node_id.to_string()))?;

        session.send(GatewayFrame::TaskStop { task_id }).await?;
        info!("Stop for task {} sent to node {}", task_id, node_id);
        Ok(())
    }

    /// Forward operator input to a running task
    pub async fn message(&self, node_id: &str, task_id: Uuid, message: String) -> Result<()> {
        let session = self
            .registry
            .lookup(node_id)
            .await
            .ok_or_else(|| Error::NodeOffline(node_id.to_string()))?;

        session
            .send(GatewayFrame::TaskMessage { task_id, message })
            .await?;
        debug!("Message for task {} sent to node {}", task_id, node_id);
        Ok(())
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        self.store.list_tasks().await
    }

    /// Handle `task:started` from the owning node
    pub async fn handle_started(&self, node_id: &str, task_id: Uuid) -> Result<()> {
        self.apply_transition(node_id, task_id, TaskStatus::Running, None, None)
            .await
    }

    /// Handle `task:progress`: relay to subscribers, no durable write
    pub fn handle_progress(&self, node_id: &str, task_id: Uuid, event: TaskEvent) {
        let _ = self.event_tx.send(TaskBroadcast {
            task_id,
            node_id: node_id.to_string(),
            event,
        });
    }

    /// Handle `task:completed` from the owning node
    pub async fn handle_completed(
        &self,
        node_id: &str,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<()> {
        self.apply_transition(node_id, task_id, TaskStatus::Completed, Some(result), None)
            .await
    }

    /// Handle `task:error` from the owning node
    pub async fn handle_error(&self, node_id: &str, task_id: Uuid, error: String) -> Result<()> {
        self.apply_transition(node_id, task_id, TaskStatus::Failed, None, Some(error))
            .await
    }

    /// Handle `task:stopped` from the owning node
    pub async fn handle_stopped(&self, node_id: &str, task_id: Uuid) -> Result<()> {
        self.apply_transition(node_id, task_id, TaskStatus::Stopped, None, None)
            .await
    }

    /// Apply a frame-driven status transition with the terminal-state guard
    async fn apply_transition(
        &self,
        node_id: &str,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            warn!("Frame for unknown task {} from node {}", task_id, node_id);
            return Ok(());
        };

        if task.assigned_node_id != node_id {
            warn!(
                "Node {} sent a frame for task {} owned by {}",
                node_id, task_id, task.assigned_node_id
            );
            return Ok(());
        }

        let applied = match status {
            TaskStatus::Completed => task.complete(result.unwrap_or(serde_json::Value::Null)),
            TaskStatus::Failed => task.fail(error.unwrap_or_else(|| "unknown error".to_string())),
            other => task.transition(other),
        };

        if !applied {
            // Late or duplicate frame after a terminal state; ignore it.
            warn!(
                "Ignoring {:?} frame for task {} already in {:?}",
                status, task_id, task.status
            );
            return Ok(());
        }

        info!("Task {} -> {:?} (node {})", task_id, status, node_id);
        self.store.put_task(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FileRecordStore;
    use crate::registry::NodeSession;
    use fleet_core::protocol::TaskEventKind;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn build_router() -> (
        TaskRouter,
        Arc<ConnectionRegistry>,
        Arc<FileRecordStore>,
        TempDir,
    ) {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(
            FileRecordStore::new(temp.path().join("records.json"))
                .await
                .unwrap(),
        );
        let router = TaskRouter::new(Arc::clone(&registry), store.clone() as Arc<dyn RecordStore>);
        (router, registry, store, temp)
    }

    #[tokio::test]
    async fn test_submit_to_offline_node_fails_without_queuing() {
        let (router, _registry, store, _temp) = build_router().await;

        let err = router
            .submit("node-a", "do things", TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeOffline(_)));

        // Nothing was queued or persisted.
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_persists_pending_before_send() {
        let (router, registry, store, _temp) = build_router().await;
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(NodeSession::new("node-a", tx)).await;

        let task = router
            .submit("node-a", "do things", TaskOptions::default())
            .await
            .unwrap();

        let persisted = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Pending);

        match rx.recv().await.unwrap() {
            GatewayFrame::TaskSubmit { task_id, goal, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(goal, "do things");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_frames_drive_status() {
        let (router, registry, store, _temp) = build_router().await;
        let (tx, _rx) = mpsc::channel(8);
        registry.register(NodeSession::new("node-a", tx)).await;

        let task = router
            .submit("node-a", "do things", TaskOptions::default())
            .await
            .unwrap();

        router.handle_started("node-a", task.id).await.unwrap();
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        router
            .handle_completed("node-a", task.id, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        // A late error frame must not overwrite the terminal state.
        router
            .handle_error("node-a", task.id, "late".to_string())
            .await
            .unwrap();
        let still_done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(still_done.status, TaskStatus::Completed);
        assert!(still_done.error.is_none());
    }

    #[tokio::test]
    async fn test_progress_reaches_subscribers() {
        let (router, registry, _store, _temp) = build_router().await;
        let (tx, _rx) = mpsc::channel(8);
        registry.register(NodeSession::new("node-a", tx)).await;

        let mut events = router.subscribe();
        let task_id = Uuid::new_v4();
        router.handle_progress(
            "node-a",
            task_id,
            TaskEvent::new(TaskEventKind::Log, "step 1"),
        );

        let received = events.recv().await.unwrap();
        assert_eq!(received.task_id, task_id);
        assert_eq!(received.node_id, "node-a");
        assert_eq!(received.event.content.as_deref(), Some("step 1"));
    }

    #[tokio::test]
    async fn test_stop_requires_live_session() {
        let (router, _registry, _store, _temp) = build_router().await;
        let err = router.stop("node-a", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NodeOffline(_)));
    }

    #[tokio::test]
    async fn test_frames_from_wrong_node_are_ignored() {
        let (router, registry, store, _temp) = build_router().await;
        let (tx, _rx) = mpsc::channel(8);
        registry.register(NodeSession::new("node-a", tx)).await;

        let task = router
            .submit("node-a", "do things", TaskOptions::default())
            .await
            .unwrap();

        router.handle_started("node-b", task.id).await.unwrap();
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}
