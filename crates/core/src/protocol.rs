//! Wire protocol frames between the gateway and its nodes
//!
//! Every frame travels as internally tagged JSON over the node's single
//! WebSocket session. Both ends match exhaustively; an unrecognized tag fails
//! deserialization and is treated as a protocol error for that session (the
//! gateway drops it and the node reconnects) rather than being ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigState;
use crate::node::{HeartbeatStatus, NodeInfo};

/// Options accompanying a task submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Kind of progress event emitted during task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Log,
    Message,
    ToolCall,
    ToolResult,
    Stdout,
    Stderr,
}

/// A progress event, relayed verbatim to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: Some(content.into()),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// Gateway -> node frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "task:submit")]
    TaskSubmit {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        goal: String,
        #[serde(default)]
        options: TaskOptions,
    },
    #[serde(rename = "task:stop")]
    TaskStop {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    #[serde(rename = "task:message")]
    TaskMessage {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        message: String,
    },
    #[serde(rename = "config:push")]
    ConfigPush,
    #[serde(rename = "ping")]
    Ping,
}

/// Node -> gateway frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeFrame {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "nodeInfo")]
        node_info: NodeInfo,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { status: HeartbeatStatus },
    #[serde(rename = "task:started")]
    TaskStarted {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    #[serde(rename = "task:progress")]
    TaskProgress {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        event: TaskEvent,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        result: serde_json::Value,
    },
    #[serde(rename = "task:error")]
    TaskError {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        error: String,
    },
    #[serde(rename = "task:stopped")]
    TaskStopped {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    #[serde(rename = "config:ack")]
    ConfigAck {
        #[serde(rename = "configState")]
        config_state: ConfigState,
    },
    #[serde(rename = "pong")]
    Pong,
}
