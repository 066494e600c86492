//! Durable record store boundary
//!
//! The gateway treats the backing store as a key-value persistence target:
//! task snapshots plus one record per node holding the desired `config` and
//! the last reported `config_sync_state` (an opaque structured blob, so its
//! shape can evolve without a schema migration).
//!
//! [`FileRecordStore`] keeps everything in a local JSON file and is used
//! standalone and in tests; [`HttpRecordStore`] forwards to the backing web
//! service with a static shared-secret header.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use fleet_core::config::ConfigSyncState;
use fleet_core::task::Task;
use fleet_core::{Error, Result};

/// Per-node durable record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecordBlob {
    /// Desired configuration, as last set by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Last reported sync state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_sync_state: Option<ConfigSyncState>,
}

/// Key-value persistence boundary for tasks and per-node records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn put_node_record(&self, node_id: &str, record: NodeRecordBlob) -> Result<()>;
    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecordBlob>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredRecords {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    nodes: HashMap<String, NodeRecordBlob>,
}

#[derive(Debug, Default)]
struct Records {
    tasks: HashMap<Uuid, Task>,
    nodes: HashMap<String, NodeRecordBlob>,
}

/// File-backed store using a single JSON document
pub struct FileRecordStore {
    path: PathBuf,
    cache: Arc<RwLock<Records>>,
}

impl FileRecordStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                Records::default()
            } else {
                let stored: StoredRecords = serde_json::from_str(&content)?;
                Records {
                    tasks: stored.tasks.into_iter().map(|t| (t.id, t)).collect(),
                    nodes: stored.nodes,
                }
            }
        } else {
            Records::default()
        };

        Ok(Self {
            path,
            cache: Arc::new(RwLock::new(cache)),
        })
    }

    async fn persist(&self) -> Result<()> {
        let cache = self.cache.read().await;
        let stored = StoredRecords {
            tasks: cache.tasks.values().cloned().collect(),
            nodes: cache.nodes.clone(),
        };
        let content = serde_json::to_string_pretty(&stored)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn put_task(&self, task: Task) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            cache.tasks.insert(task.id, task);
        }
        self.persist().await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let cache = self.cache.read().await;
        Ok(cache.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let cache = self.cache.read().await;
        let mut tasks: Vec<Task> = cache.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn put_node_record(&self, node_id: &str, record: NodeRecordBlob) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            cache.nodes.insert(node_id.to_string(), record);
        }
        self.persist().await
    }

    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecordBlob>> {
        let cache = self.cache.read().await;
        Ok(cache.nodes.get(node_id).cloned())
    }
}

/// Client for the backing web service's record endpoints
///
/// Service-to-service calls carry a static shared secret in the
/// `x-service-token` header, never a per-user session cookie.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl HttpRecordStore {
    pub fn new(base_url: impl Into<String>, service_token: impl Into<String>) -> Self {
        Self {
            // Internal service traffic; never route through a proxy.
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
            service_token: service_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn put_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let response = self
            .client
            .put(self.url(path))
            .header("x-service-token", &self.service_token)
            .json(body)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("record store unreachable: {}", err)))?;

        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "record store returned {} for {}",
                response.status(),
                path
            )));
        }
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get(self.url(path))
            .header("x-service-token", &self.service_token)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("record store unreachable: {}", err)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "record store returned {} for {}",
                response.status(),
                path
            )));
        }
        let value = response
            .json::<T>()
            .await
            .map_err(|err| Error::Storage(format!("invalid record store payload: {}", err)))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn put_task(&self, task: Task) -> Result<()> {
        self.put_json(&format!("/records/tasks/{}", task.id), &task)
            .await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.get_json(&format!("/records/tasks/{}", id)).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .get_json::<Vec<Task>>("/records/tasks")
            .await?
            .unwrap_or_default())
    }

    async fn put_node_record(&self, node_id: &str, record: NodeRecordBlob) -> Result<()> {
        self.put_json(&format!("/records/nodes/{}", node_id), &record)
            .await
    }

    async fn get_node_record(&self, node_id: &str) -> Result<Option<NodeRecordBlob>> {
        self.get_json(&format!("/records/nodes/{}", node_id)).await
    }
}
