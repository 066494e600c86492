//! Node enrollment store
//!
//! Owns node registration records and the per-node bearer tokens used to
//! authenticate transport handshakes. Tokens are returned once at issue time;
//! only their SHA-256 digest is stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use fleet_core::{Error, Result};

/// A registered node, as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    auth_token_hash: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on first successful connection; distinguishes `pending` from
    /// `offline` in derived status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Token handed back to the caller at registration/rotation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedNodeToken {
    pub node_id: String,
    pub token: String,
    pub token_type: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredNodeState {
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Default)]
struct NodeState {
    nodes: HashMap<String, NodeRecord>,
}

impl From<StoredNodeState> for NodeState {
    fn from(value: StoredNodeState) -> Self {
        Self {
            nodes: value
                .nodes
                .into_iter()
                .map(|record| (record.node_id.clone(), record))
                .collect(),
        }
    }
}

impl From<&NodeState> for StoredNodeState {
    fn from(value: &NodeState) -> Self {
        Self {
            nodes: value.nodes.values().cloned().collect(),
        }
    }
}

#[derive(Clone)]
pub struct NodeStore {
    state: Arc<RwLock<NodeState>>,
    file_path: PathBuf,
}

impl NodeStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|err| Error::Storage(format!("Failed to create node dir: {}", err)))?;

        let file_path = base_dir.join("nodes.json");
        let state = load_state(&file_path).await?;

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            file_path,
        })
    }

    /// Register a node, issuing a fresh bearer token
    ///
    /// Re-registering an existing id rotates its token, which invalidates any
    /// outstanding one.
    pub async fn register_node(
        &self,
        node_id: &str,
        name: Option<String>,
        capabilities: Vec<String>,
    ) -> Result<IssuedNodeToken> {
        let node_id = normalize_node_id(node_id)?;
        let token = generate_token();
        let now = Utc::now();

        let mut state = self.state.write().await;
        match state.nodes.get_mut(&node_id) {
            Some(existing) => {
                existing.auth_token_hash = token_digest(&token);
                existing.updated_at = now;
                if name.is_some() {
                    existing.name = name;
                }
                if !capabilities.is_empty() {
                    existing.capabilities = capabilities;
                }
            }
            None => {
                state.nodes.insert(
                    node_id.clone(),
                    NodeRecord {
                        node_id: node_id.clone(),
                        name,
                        auth_token_hash: token_digest(&token),
                        capabilities,
                        created_at: now,
                        updated_at: now,
                        last_seen_at: None,
                    },
                );
            }
        }

        persist_state(&self.file_path, &state).await?;
        Ok(IssuedNodeToken {
            node_id,
            token,
            token_type: "Bearer".to_string(),
        })
    }

    /// Rotate a node's token, invalidating the previous one
    pub async fn rotate_token(&self, node_id: &str) -> Result<IssuedNodeToken> {
        let node_id = normalize_node_id(node_id)?;
        let token = generate_token();

        let mut state = self.state.write().await;
        let record = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.clone()))?;
        record.auth_token_hash = token_digest(&token);
        record.updated_at = Utc::now();

        persist_state(&self.file_path, &state).await?;
        Ok(IssuedNodeToken {
            node_id,
            token,
            token_type: "Bearer".to_string(),
        })
    }

    /// Verify a presented bearer token against the stored digest
    pub async fn verify_token(&self, node_id: &str, token: &str) -> Result<NodeRecord> {
        let node_id = normalize_node_id(node_id)?;
        let state = self.state.read().await;
        let record = state
            .nodes
            .get(&node_id)
            .ok_or_else(|| Error::Auth(format!("node {} is not registered", node_id)))?;

        if record.auth_token_hash != token_digest(token) {
            return Err(Error::Auth(format!("invalid token for node {}", node_id)));
        }
        Ok(record.clone())
    }

    /// Record that the node has connected at least once
    pub async fn mark_seen(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.nodes.get_mut(node_id) {
            record.last_seen_at = Some(Utc::now());
            record.updated_at = Utc::now();
            persist_state(&self.file_path, &state).await?;
        }
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeRecord> {
        let state = self.state.read().await;
        state.nodes.get(node_id).cloned()
    }

    pub async fn list(&self) -> Vec<NodeRecord> {
        let state = self.state.read().await;
        let mut nodes: Vec<NodeRecord> = state.nodes.values().cloned().collect();
        nodes.sort_by(|left, right| left.node_id.cmp(&right.node_id));
        nodes
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn normalize_node_id(value: &str) -> Result<String> {
    let normalized = value.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(Error::InvalidInput("node_id cannot be empty".to_string()));
    }
    if !normalized
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(Error::InvalidInput(
            "node_id supports only [a-zA-Z0-9-_]".to_string(),
        ));
    }
    Ok(normalized)
}

async fn load_state(path: &Path) -> Result<NodeState> {
    if !path.exists() {
        return Ok(NodeState::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::Storage(format!("Failed to read node state: {}", err)))?;
    if content.trim().is_empty() {
        return Ok(NodeState::default());
    }
    let state: StoredNodeState = serde_json::from_str(&content)
        .map_err(|err| Error::Storage(format!("Failed to parse node state: {}", err)))?;
    Ok(state.into())
}

async fn persist_state(path: &Path, state: &NodeState) -> Result<()> {
    let content = serde_json::to_string_pretty(&StoredNodeState::from(state))
        .map_err(|err| Error::Storage(format!("Failed to serialize node state: {}", err)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::Storage(format!("Failed to create node dir: {}", err)))?;
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|err| Error::Storage(format!("Failed to write node state: {}", err)))?;
    Ok(())
}
