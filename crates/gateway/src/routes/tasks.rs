//! Task API endpoints
//!
//! Submission and stop calls are routed to the owning node's live session;
//! an unreachable node fails the call synchronously.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use fleet_core::protocol::TaskOptions;
use fleet_core::task::Task;
use fleet_core::Error;

use crate::auth::require_service_token;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub node_id: String,
    pub goal: String,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessageRequest {
    pub message: String,
}

async fn submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    require_service_token(&state, &headers)?;
    let task = state
        .tasks()
        .submit(&request.node_id, request.goal, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Task>>, ApiError> {
    require_service_token(&state, &headers)?;
    Ok(Json(state.tasks().list().await?))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    require_service_token(&state, &headers)?;
    let task = state
        .tasks()
        .get(task_id)
        .await?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
    Ok(Json(task))
}

async fn stop_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_service_token(&state, &headers)?;
    let task = state
        .tasks()
        .get(task_id)
        .await?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

    state.tasks().stop(&task.assigned_node_id, task_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn message_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(request): Json<TaskMessageRequest>,
) -> Result<StatusCode, ApiError> {
    require_service_token(&state, &headers)?;
    let task = state
        .tasks()
        .get(task_id)
        .await?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

    state
        .tasks()
        .message(&task.assigned_node_id, task_id, request.message)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{task_id}", get(get_task))
        .route("/api/tasks/{task_id}/stop", post(stop_task))
        .route("/api/tasks/{task_id}/message", post(message_task))
}
