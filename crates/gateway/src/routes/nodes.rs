//! Node API endpoints
//!
//! Service-to-service surface for the backing web service: registration and
//! token rotation, the live node list with derived status, and the config
//! push/pull/state endpoints. The config GET also accepts the node's own
//! bearer token, since it doubles as the node's pull endpoint.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleet_core::config::ConfigSyncState;
use fleet_core::node::NodeStatus;
use fleet_core::skill::{aggregate, SkillVerdict};
use fleet_core::Error;

use crate::auth::{authorize_config_read, require_service_token};
use crate::error::ApiError;
use crate::nodes::IssuedNodeToken;
use crate::registry::SessionSnapshot;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusResponse {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_for_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    pub skills: Vec<SkillVerdict>,
}

async fn register_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<IssuedNodeToken>), ApiError> {
    require_service_token(&state, &headers)?;
    let issued = state
        .node_store()
        .register_node(&request.node_id, request.name, request.capabilities)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn rotate_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<IssuedNodeToken>, ApiError> {
    require_service_token(&state, &headers)?;
    let issued = state.node_store().rotate_token(&node_id).await?;
    Ok(Json(issued))
}

async fn list_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<NodeStatusResponse>>, ApiError> {
    require_service_token(&state, &headers)?;

    let snapshots: HashMap<String, SessionSnapshot> = state
        .registry()
        .snapshots()
        .await
        .into_iter()
        .map(|snapshot| (snapshot.node_id.clone(), snapshot))
        .collect();

    let nodes = state
        .node_store()
        .list()
        .await
        .into_iter()
        .map(|record| {
            let snapshot = snapshots.get(&record.node_id);
            // Status is derived at read time from registry membership, never
            // read back from storage.
            let status = match (snapshot, record.last_seen_at) {
                (Some(_), _) => NodeStatus::Active,
                (None, Some(_)) => NodeStatus::Offline,
                (None, None) => NodeStatus::Pending,
            };
            let last_status = snapshot.and_then(|s| s.last_status.as_ref());

            NodeStatusResponse {
                node_id: record.node_id,
                name: record.name,
                status,
                capabilities: record.capabilities,
                last_heartbeat_secs: snapshot.map(|s| s.last_heartbeat_age.as_secs()),
                connected_for_secs: snapshot.map(|s| s.connected_for.as_secs()),
                config_version: last_status
                    .and_then(|s| s.config_state.as_ref())
                    .map(|c| c.config_version.clone()),
                skills: last_status
                    .map(|s| aggregate(&s.skill_health))
                    .unwrap_or_default(),
            }
        })
        .collect();

    Ok(Json(nodes))
}

async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_config_read(&state, &node_id, &headers).await?;
    let config = state
        .config_sync()
        .desired_config(&node_id)
        .await?
        .ok_or_else(|| Error::NodeNotFound(format!("no configuration for {}", node_id)))?;
    Ok(Json(config))
}

async fn put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    require_service_token(&state, &headers)?;
    state.config_sync().set_desired_config(&node_id, config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn push_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<ConfigSyncState>, ApiError> {
    require_service_token(&state, &headers)?;
    let sync = state.config_sync().push(&node_id).await?;
    Ok(Json(sync))
}

async fn get_sync_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<ConfigSyncState>, ApiError> {
    require_service_token(&state, &headers)?;
    let sync = state.config_sync().sync_state(&node_id).await?;
    Ok(Json(sync))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/nodes", post(register_node).get(list_nodes))
        .route("/api/nodes/{node_id}/token", post(rotate_token))
        .route(
            "/api/nodes/{node_id}/config",
            get(get_config).put(put_config),
        )
        .route("/api/nodes/{node_id}/config/push", post(push_config))
        .route("/api/nodes/{node_id}/config/state", get(get_sync_state))
}
