//! Node identity and status reporting

use serde::{Deserialize, Serialize};

use crate::config::ConfigState;
use crate::skill::SkillHealthCheck;

/// Externally visible node status
///
/// Derived at read time from registry membership, never stored as a source of
/// truth: `active` iff a live session exists, `offline` once a node that has
/// connected before drops out, `pending` for a registration that has never
/// connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    Offline,
}

/// Machine snapshot a node sends at connect time and in every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl NodeInfo {
    /// Snapshot the local machine
    pub fn capture(capabilities: Vec<String>) -> Self {
        Self {
            hostname: hostname_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities,
        }
    }
}

fn hostname_string() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Heartbeat payload: the machine snapshot, the full skill health report
/// (never a lossy summary), and the current config state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub node_info: NodeInfo,
    #[serde(default)]
    pub skill_health: Vec<SkillHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_state: Option<ConfigState>,
}
