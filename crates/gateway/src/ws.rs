//! WebSocket intake for node connections
//!
//! Nodes always initiate; the gateway only accepts. A connection presents the
//! node's bearer token before upgrade, then announces itself with a
//! `connected` frame, at which point its session is installed in the registry.
//! A malformed or unrecognized frame is a protocol error for the session: it
//! is logged and the session is dropped, forcing the node to reconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use fleet_core::protocol::{GatewayFrame, NodeFrame};
use fleet_core::Error;

use crate::auth::extract_bearer_token;
use crate::registry::NodeSession;
use crate::state::AppState;

/// Query parameters for the WS handshake
#[derive(Debug, serde::Deserialize)]
pub struct WsQuery {
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

/// WebSocket upgrade handler
pub async fn node_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let token = match extract_bearer_token(&headers) {
        Ok(token) => token,
        Err(err) => {
            warn!("Rejected node connection {}: {}", query.node_id, err);
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let record = match state.node_store().verify_token(&query.node_id, token).await {
        Ok(record) => record,
        Err(err) => {
            let status = match err {
                Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNAUTHORIZED,
            };
            warn!(
                "Rejected node connection node={} reason={} status={}",
                query.node_id, err, status
            );
            return (status, "Unauthorized").into_response();
        }
    };

    info!("New node connection: {}", record.node_id);
    ws.on_upgrade(move |socket| handle_node_socket(socket, record.node_id, state))
        .into_response()
}

/// Drive one node's WebSocket session until it closes or is superseded
async fn handle_node_socket(socket: WebSocket, node_id: String, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound frame queue for this session; routing callers enqueue here.
    let (tx, mut rx) = mpsc::channel::<GatewayFrame>(100);
    let session = NodeSession::new(node_id.clone(), tx);
    let session_id = session.session_id;
    let mut close_rx = session.closed();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                }
            }
        }
    });

    let mut registered = false;

    loop {
        tokio::select! {
            // The registry raised the close signal: superseded by a newer
            // session, evicted as stale, or gateway shutdown.
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    info!("Session for node {} closed by registry", node_id);
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                let Some(result) = incoming else {
                    info!("Node {} transport ended", node_id);
                    break;
                };
                match result {
                    Ok(Message::Text(text)) => {
                        let frame = match serde_json::from_str::<NodeFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                // Protocol drift surfaces here; drop the
                                // session instead of limping along.
                                warn!(
                                    "Malformed frame from node {}, dropping session: {}",
                                    node_id, e
                                );
                                break;
                            }
                        };

                        if let NodeFrame::Connected { node_info } = &frame {
                            if registered {
                                // Re-registering the same session would close
                                // its own shared close signal.
                                warn!("Duplicate connected frame from node {}", node_id);
                                continue;
                            }
                            info!(
                                "Node {} registered (host {}, {} skills)",
                                node_id,
                                node_info.hostname,
                                node_info.capabilities.len()
                            );
                            state.registry().register(session.clone()).await;
                            let _ = state.node_store().mark_seen(&node_id).await;
                            registered = true;
                            continue;
                        }

                        if !registered {
                            warn!(
                                "Node {} sent {:?} before connected frame, dropping session",
                                node_id,
                                frame_tag(&frame)
                            );
                            break;
                        }

                        handle_node_frame(&state, &node_id, frame).await;
                    }
                    Ok(Message::Close(_)) => {
                        info!("Node {} sent close frame", node_id);
                        break;
                    }
                    Ok(Message::Ping(_)) => {
                        debug!("WS ping from node {}", node_id);
                    }
                    Ok(Message::Pong(_)) => {
                        debug!("WS pong from node {}", node_id);
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Unexpected binary message from node {}, dropping session", node_id);
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error from node {}: {}", node_id, e);
                        break;
                    }
                }
            }
        }
    }

    // Only remove the registry entry if this loop's session is still the
    // current one; a successor session must survive our cleanup.
    if registered {
        state.registry().remove_if_current(&node_id, session_id).await;
    }
    info!("Node {} disconnected", node_id);
    send_task.abort();
}

/// Dispatch a single inbound frame
async fn handle_node_frame(state: &AppState, node_id: &str, frame: NodeFrame) {
    match frame {
        NodeFrame::Connected { .. } => unreachable!("handled by the socket loop"),

        NodeFrame::Heartbeat { status } => {
            state.registry().touch(node_id, Some(status)).await;
        }

        NodeFrame::TaskStarted { task_id } => {
            if let Err(e) = state.tasks().handle_started(node_id, task_id).await {
                error!("Failed to record task start {}: {}", task_id, e);
            }
        }

        NodeFrame::TaskProgress { task_id, event } => {
            state.tasks().handle_progress(node_id, task_id, event);
        }

        NodeFrame::TaskCompleted { task_id, result } => {
            if let Err(e) = state.tasks().handle_completed(node_id, task_id, result).await {
                error!("Failed to record task completion {}: {}", task_id, e);
            }
        }

        NodeFrame::TaskError { task_id, error } => {
            if let Err(e) = state.tasks().handle_error(node_id, task_id, error).await {
                error!("Failed to record task failure {}: {}", task_id, e);
            }
        }

        NodeFrame::TaskStopped { task_id } => {
            if let Err(e) = state.tasks().handle_stopped(node_id, task_id).await {
                error!("Failed to record task stop {}: {}", task_id, e);
            }
        }

        NodeFrame::ConfigAck { config_state } => {
            if let Err(e) = state.config_sync().handle_ack(node_id, config_state).await {
                error!("Failed to persist config ack from {}: {}", node_id, e);
            }
        }

        NodeFrame::Pong => {
            debug!("Pong from node {}", node_id);
        }
    }
}

fn frame_tag(frame: &NodeFrame) -> &'static str {
    match frame {
        NodeFrame::Connected { .. } => "connected",
        NodeFrame::Heartbeat { .. } => "heartbeat",
        NodeFrame::TaskStarted { .. } => "task:started",
        NodeFrame::TaskProgress { .. } => "task:progress",
        NodeFrame::TaskCompleted { .. } => "task:completed",
        NodeFrame::TaskError { .. } => "task:error",
        NodeFrame::TaskStopped { .. } => "task:stopped",
        NodeFrame::ConfigAck { .. } => "config:ack",
        NodeFrame::Pong => "pong",
    }
}
