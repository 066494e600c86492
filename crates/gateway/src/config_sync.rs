//! Config sync coordinator - drives the push/validate/acknowledge handshake
//!
//! Delivery failure moves the per-node sync state to `failed` and is reported
//! to the caller synchronously. A failed push is never retried automatically
//! on the node's next connection: a stale push could apply configuration the
//! operator no longer wants applied.

use std::sync::Arc;

use tracing::{info, warn};

use fleet_core::config::{ConfigState, ConfigSyncState, ConfigSyncStatus};
use fleet_core::protocol::GatewayFrame;
use fleet_core::{Error, Result};

use crate::records::{NodeRecordBlob, RecordStore};
use crate::registry::ConnectionRegistry;

pub struct ConfigSyncCoordinator {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
}

impl ConfigSyncCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn RecordStore>) -> Self {
        Self { registry, store }
    }

    /// Store the desired configuration for a node
    pub async fn set_desired_config(
        &self,
        node_id: &str,
        config: serde_json::Value,
    ) -> Result<()> {
        let mut record = self
            .store
            .get_node_record(node_id)
            .await?
            .unwrap_or_default();
        record.config = Some(config);
        self.store.put_node_record(node_id, record).await
    }

    /// The desired configuration, as the node's pull endpoint serves it
    pub async fn desired_config(&self, node_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .store
            .get_node_record(node_id)
            .await?
            .and_then(|record| record.config))
    }

    /// Trigger a config push to a node
    ///
    /// Requires a desired configuration to exist. If the node is unreachable
    /// the sync state is persisted as `failed` and `ConfigDelivery` is
    /// returned synchronously — never queued.
    pub async fn push(&self, node_id: &str) -> Result<ConfigSyncState> {
        if self.desired_config(node_id).await?.is_none() {
            return Err(Error::InvalidInput(format!(
                "no desired configuration stored for node {}",
                node_id
            )));
        }

        let Some(session) = self.registry.lookup(node_id).await else {
            return self.record_delivery_failure(node_id).await;
        };

        if session.send(GatewayFrame::ConfigPush).await.is_err() {
            return self.record_delivery_failure(node_id).await;
        }

        let state = ConfigSyncState {
            status: ConfigSyncStatus::PendingValidation,
            state: self.last_reported_state(node_id).await?,
            updated_at: chrono::Utc::now(),
        };
        self.persist_sync_state(node_id, state.clone()).await?;
        info!("Config push delivered to node {}", node_id);
        Ok(state)
    }

    /// Handle a `config:ack` frame: persist the full reported state, keyed by
    /// node id, so a gateway restart does not lose the last known truth
    pub async fn handle_ack(&self, node_id: &str, config_state: ConfigState) -> Result<()> {
        let sync = ConfigSyncState::from_ack(config_state);
        info!(
            "Config ack from node {}: {:?} (version {})",
            node_id,
            sync.status,
            sync.state
                .as_ref()
                .map(|s| s.config_version.as_str())
                .unwrap_or("-")
        );
        self.persist_sync_state(node_id, sync).await
    }

    /// Last persisted sync state, `unknown` when nothing was ever reported
    pub async fn sync_state(&self, node_id: &str) -> Result<ConfigSyncState> {
        Ok(self
            .store
            .get_node_record(node_id)
            .await?
            .and_then(|record| record.config_sync_state)
            .unwrap_or_else(ConfigSyncState::unknown))
    }

    async fn last_reported_state(&self, node_id: &str) -> Result<Option<ConfigState>> {
        Ok(self
            .store
            .get_node_record(node_id)
            .await?
            .and_then(|record| record.config_sync_state)
            .and_then(|sync| sync.state))
    }

    async fn record_delivery_failure(&self, node_id: &str) -> Result<ConfigSyncState> {
        warn!("Config push to node {} failed: node unreachable", node_id);
        let state = ConfigSyncState {
            status: ConfigSyncStatus::Failed,
            state: self.last_reported_state(node_id).await?,
            updated_at: chrono::Utc::now(),
        };
        self.persist_sync_state(node_id, state).await?;
        Err(Error::ConfigDelivery(node_id.to_string()))
    }

    async fn persist_sync_state(&self, node_id: &str, state: ConfigSyncState) -> Result<()> {
        let mut record = self
            .store
            .get_node_record(node_id)
            .await?
            .unwrap_or_default();
        record.config_sync_state = Some(state);
        self.store.put_node_record(node_id, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FileRecordStore;
    use crate::registry::NodeSession;
    use chrono::Utc;
    use fleet_core::config::{
        config_version, ConfigValidation, ValidationCategory, ValidationStatus,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn build_coordinator() -> (
        ConfigSyncCoordinator,
        Arc<ConnectionRegistry>,
        TempDir,
    ) {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(
            FileRecordStore::new(temp.path().join("records.json"))
                .await
                .unwrap(),
        );
        let coordinator =
            ConfigSyncCoordinator::new(Arc::clone(&registry), store as Arc<dyn RecordStore>);
        (coordinator, registry, temp)
    }

    #[tokio::test]
    async fn test_push_to_offline_node_records_failure() {
        let (coordinator, _registry, _temp) = build_coordinator().await;
        coordinator
            .set_desired_config("node-a", serde_json::json!({"skills": []}))
            .await
            .unwrap();

        let err = coordinator.push("node-a").await.unwrap_err();
        assert!(matches!(err, Error::ConfigDelivery(_)));

        let state = coordinator.sync_state("node-a").await.unwrap();
        assert_eq!(state.status, ConfigSyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_push_requires_desired_config() {
        let (coordinator, _registry, _temp) = build_coordinator().await;
        let err = coordinator.push("node-a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_push_then_ack_round_trip() {
        let (coordinator, registry, _temp) = build_coordinator().await;
        let config = serde_json::json!({"llmKeys": {"anthropic": "sk-test"}});
        coordinator
            .set_desired_config("node-a", config.clone())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        registry.register(NodeSession::new("node-a", tx)).await;

        let state = coordinator.push("node-a").await.unwrap();
        assert_eq!(state.status, ConfigSyncStatus::PendingValidation);
        assert!(matches!(
            rx.recv().await.unwrap(),
            GatewayFrame::ConfigPush
        ));

        // The node validates and acknowledges.
        let reported = ConfigState {
            config_version: config_version(&config),
            last_config_pull_at: Utc::now(),
            validations: ValidationCategory::ALL
                .iter()
                .map(|category| ConfigValidation {
                    category: *category,
                    status: ValidationStatus::Verified,
                    message: None,
                    checked_at: Utc::now(),
                })
                .collect(),
        };
        coordinator
            .handle_ack("node-a", reported.clone())
            .await
            .unwrap();

        let state = coordinator.sync_state("node-a").await.unwrap();
        assert_eq!(state.status, ConfigSyncStatus::Verified);
        let persisted = state.state.unwrap();
        assert_eq!(persisted.config_version, config_version(&config));
        assert_eq!(persisted.validations.len(), ValidationCategory::ALL.len());
    }

    #[tokio::test]
    async fn test_mixed_ack_is_partially_verified() {
        let (coordinator, _registry, _temp) = build_coordinator().await;
        let reported = ConfigState {
            config_version: "abc".to_string(),
            last_config_pull_at: Utc::now(),
            validations: vec![
                ConfigValidation {
                    category: ValidationCategory::LlmKeys,
                    status: ValidationStatus::Verified,
                    message: None,
                    checked_at: Utc::now(),
                },
                ConfigValidation {
                    category: ValidationCategory::Oauth,
                    status: ValidationStatus::Failed,
                    message: Some("token expired".to_string()),
                    checked_at: Utc::now(),
                },
            ],
        };

        coordinator.handle_ack("node-a", reported).await.unwrap();
        let state = coordinator.sync_state("node-a").await.unwrap();
        assert_eq!(state.status, ConfigSyncStatus::PartiallyVerified);
    }

    #[tokio::test]
    async fn test_sync_state_defaults_to_unknown() {
        let (coordinator, _registry, _temp) = build_coordinator().await;
        let state = coordinator.sync_state("node-a").await.unwrap();
        assert_eq!(state.status, ConfigSyncStatus::Unknown);
    }
}
