//! Task model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Terminal statuses are final and must not be overwritten by late or
    /// duplicate frames.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// A task dispatched to a specific node
///
/// Status transitions are driven solely by frames received from the owning
/// node's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    pub assigned_node_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task assigned to the given node
    pub fn new(goal: impl Into<String>, assigned_node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            assigned_node_id: assigned_node_id.into(),
            status: TaskStatus::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition, refusing to leave a terminal state.
    ///
    /// Returns `false` when the transition was ignored because the task is
    /// already terminal.
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }

    /// Record a successful completion
    pub fn complete(&mut self, result: serde_json::Value) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        true
    }

    /// Record a task-level failure
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("run checks", "node-a");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_node_id, "node-a");
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = Task::new("run checks", "node-a");
        assert!(task.transition(TaskStatus::Running));
        assert!(task.complete(serde_json::json!({"ok": true})));

        // A late failure frame must not overwrite the completion.
        assert!(!task.fail("late error"));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut task = Task::new("run checks", "node-a");
        task.transition(TaskStatus::Running);
        assert!(task.transition(TaskStatus::Stopped));
        assert!(!task.transition(TaskStatus::Running));
        assert!(task.status.is_terminal());
    }
}
