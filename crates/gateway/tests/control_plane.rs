//! Control-plane scenarios exercised against real registry, router and
//! coordinator instances wired to a file-backed record store.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use fleet_core::protocol::{GatewayFrame, TaskOptions};
use fleet_core::task::TaskStatus;
use fleet_core::Error;
use fleet_gateway::config_sync::ConfigSyncCoordinator;
use fleet_gateway::records::{FileRecordStore, RecordStore};
use fleet_gateway::registry::{ConnectionRegistry, NodeSession};
use fleet_gateway::router::TaskRouter;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    store: Arc<FileRecordStore>,
    router: TaskRouter,
    coordinator: ConfigSyncCoordinator,
    _temp: TempDir,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());
    let store = Arc::new(
        FileRecordStore::new(temp.path().join("records.json"))
            .await
            .unwrap(),
    );
    let router = TaskRouter::new(
        Arc::clone(&registry),
        store.clone() as Arc<dyn RecordStore>,
    );
    let coordinator = ConfigSyncCoordinator::new(
        Arc::clone(&registry),
        store.clone() as Arc<dyn RecordStore>,
    );
    Harness {
        registry,
        store,
        router,
        coordinator,
        _temp: temp,
    }
}

fn connect(node_id: &str) -> (NodeSession, mpsc::Receiver<GatewayFrame>) {
    let (tx, rx) = mpsc::channel(32);
    (NodeSession::new(node_id, tx), rx)
}

#[tokio::test]
async fn transport_killed_mid_task_leaves_honest_state() {
    let h = harness().await;
    let (session, mut rx) = connect("node-a");
    h.registry.register(session).await;

    // Node picks up a task and reports it running.
    let task = h
        .router
        .submit("node-a", "long running job", TaskOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        GatewayFrame::TaskSubmit { .. }
    ));
    h.router.handle_started("node-a", task.id).await.unwrap();

    // The transport dies; the staleness sweep evicts the node.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let evicted = h.registry.sweep_stale(Duration::from_millis(10)).await;
    assert_eq!(evicted, vec!["node-a".to_string()]);

    // Stop now fails loudly instead of pretending to succeed.
    let err = h.router.stop("node-a", task.id).await.unwrap_err();
    assert!(matches!(err, Error::NodeOffline(_)));

    // The task's last known status remains running; eviction must not
    // silently mark it failed.
    let persisted = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::Running);
}

#[tokio::test]
async fn reconnect_replaces_session_and_routing_follows() {
    let h = harness().await;
    let (first, mut first_rx) = connect("node-a");
    let first_handle = first.clone();
    h.registry.register(first).await;

    // The node reconnects (e.g. after a network blip) before the old
    // transport was reaped.
    let (second, mut second_rx) = connect("node-a");
    h.registry.register(second).await;
    assert!(first_handle.is_closed());

    // New submissions flow to the new session only.
    h.router
        .submit("node-a", "after reconnect", TaskOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        second_rx.recv().await.unwrap(),
        GatewayFrame::TaskSubmit { .. }
    ));
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn config_push_round_trip_persists_reported_truth() {
    let h = harness().await;
    let config = serde_json::json!({
        "llmKeys": {"anthropic": "sk-test"},
        "skills": ["shell", "browser"],
    });
    h.coordinator
        .set_desired_config("node-a", config.clone())
        .await
        .unwrap();

    let (session, mut rx) = connect("node-a");
    h.registry.register(session).await;

    h.coordinator.push("node-a").await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), GatewayFrame::ConfigPush));

    // The node pulls, validates two categories, and acknowledges. The
    // persisted state must contain exactly the categories it reported.
    use chrono::Utc;
    use fleet_core::config::{
        config_version, ConfigState, ConfigValidation, ValidationCategory, ValidationStatus,
    };

    let reported = ConfigState {
        config_version: config_version(&config),
        last_config_pull_at: Utc::now(),
        validations: vec![
            ConfigValidation {
                category: ValidationCategory::LlmKeys,
                status: ValidationStatus::Verified,
                message: None,
                checked_at: Utc::now(),
            },
            ConfigValidation {
                category: ValidationCategory::BinaryDeps,
                status: ValidationStatus::Failed,
                message: Some("rg not found".to_string()),
                checked_at: Utc::now(),
            },
        ],
    };
    h.coordinator
        .handle_ack("node-a", reported)
        .await
        .unwrap();

    let sync = h.coordinator.sync_state("node-a").await.unwrap();
    let state = sync.state.unwrap();
    assert_eq!(state.config_version, config_version(&config));
    assert_eq!(state.validations.len(), 2);
    assert_eq!(
        state.validation_status(ValidationCategory::LlmKeys),
        ValidationStatus::Verified
    );
    // Unreported categories stay unchecked, never inferred as verified.
    assert_eq!(
        state.validation_status(ValidationCategory::Oauth),
        ValidationStatus::Unchecked
    );
}

#[tokio::test]
async fn back_to_back_pushes_end_with_latest_ack() {
    let h = harness().await;
    let (session, mut rx) = connect("node-a");
    h.registry.register(session).await;

    let first = serde_json::json!({"rev": 1});
    let second = serde_json::json!({"rev": 2});

    h.coordinator
        .set_desired_config("node-a", first)
        .await
        .unwrap();
    h.coordinator.push("node-a").await.unwrap();

    h.coordinator
        .set_desired_config("node-a", second.clone())
        .await
        .unwrap();
    h.coordinator.push("node-a").await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), GatewayFrame::ConfigPush));
    assert!(matches!(rx.recv().await.unwrap(), GatewayFrame::ConfigPush));

    // The node processes pulls serially; the final ack reflects only the
    // most recently pulled configuration.
    use chrono::Utc;
    use fleet_core::config::{config_version, ConfigState};

    h.coordinator
        .handle_ack(
            "node-a",
            ConfigState {
                config_version: config_version(&second),
                last_config_pull_at: Utc::now(),
                validations: Vec::new(),
            },
        )
        .await
        .unwrap();

    let sync = h.coordinator.sync_state("node-a").await.unwrap();
    assert_eq!(
        sync.state.unwrap().config_version,
        config_version(&second)
    );
}

#[tokio::test]
async fn full_task_lifecycle_orders_frames() {
    let h = harness().await;
    let (session, _rx) = connect("node-a");
    h.registry.register(session).await;

    let task = h
        .router
        .submit("node-a", "ordered job", TaskOptions::default())
        .await
        .unwrap();

    h.router.handle_started("node-a", task.id).await.unwrap();
    h.router
        .handle_stopped("node-a", task.id)
        .await
        .unwrap();

    // Frames after the terminal one are ignored.
    h.router
        .handle_completed("node-a", task.id, serde_json::json!({}))
        .await
        .unwrap();

    let persisted = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::Stopped);
    assert!(persisted.result.is_none());
}
