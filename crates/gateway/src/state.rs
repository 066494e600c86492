//! Application state
//!
//! All services are explicitly constructed here and handed to handlers via
//! axum state; nothing is ambient, so tests can build isolated instances.

use std::path::PathBuf;
use std::sync::Arc;

use fleet_core::Result;

use crate::config_sync::ConfigSyncCoordinator;
use crate::nodes::NodeStore;
use crate::records::{FileRecordStore, RecordStore};
use crate::registry::ConnectionRegistry;
use crate::router::TaskRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<ConnectionRegistry>,
    node_store: NodeStore,
    records: Arc<dyn RecordStore>,
    tasks: TaskRouter,
    config_sync: ConfigSyncCoordinator,
    service_token: String,
}

impl AppState {
    /// Build state backed by a local file record store
    pub async fn new(data_dir: PathBuf, service_token: String) -> Result<Self> {
        let records: Arc<dyn RecordStore> =
            Arc::new(FileRecordStore::new(data_dir.join("records.json")).await?);
        Self::with_record_store(data_dir, service_token, records).await
    }

    /// Build state with an injected record store (the HTTP-backed store, or a
    /// test double)
    pub async fn with_record_store(
        data_dir: PathBuf,
        service_token: String,
        records: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let node_store = NodeStore::new(data_dir.join("nodes")).await?;
        let tasks = TaskRouter::new(Arc::clone(&registry), Arc::clone(&records));
        let config_sync = ConfigSyncCoordinator::new(Arc::clone(&registry), Arc::clone(&records));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                registry,
                node_store,
                records,
                tasks,
                config_sync,
                service_token,
            }),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn node_store(&self) -> &NodeStore {
        &self.inner.node_store
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.inner.records
    }

    pub fn tasks(&self) -> &TaskRouter {
        &self.inner.tasks
    }

    pub fn config_sync(&self) -> &ConfigSyncCoordinator {
        &self.inner.config_sync
    }

    pub fn service_token(&self) -> &str {
        &self.inner.service_token
    }
}
