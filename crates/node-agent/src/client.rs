//! Outbound connection loop
//!
//! The node always initiates; the gateway only accepts. This loop owns the
//! transport: connect, announce, heartbeat, drain the outbound queue, and on
//! any transport error reconnect forever with capped exponential backoff plus
//! jitter. Only a rejected token aborts the loop; a new token has to be
//! obtained out-of-band.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use fleet_core::node::{HeartbeatStatus, NodeInfo};
use fleet_core::protocol::{GatewayFrame, NodeFrame};

use crate::agent::{AgentPhase, AgentSettings};
use crate::config_sync::SharedConfigState;
use crate::error::{AgentError, Result};
use crate::executor::TaskExecutor;
use crate::skills::SkillSet;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Everything the connection loop hands inbound frames to
pub struct ConnectionHandles {
    pub executor: Arc<TaskExecutor>,
    pub pull_trigger: mpsc::Sender<()>,
    pub skills: SkillSet,
    pub config_state: SharedConfigState,
}

/// Reconnect forever; returns only on a fatal auth rejection
pub async fn run_connection_loop(
    settings: AgentSettings,
    handles: ConnectionHandles,
    mut outbound_rx: mpsc::Receiver<NodeFrame>,
    phase_tx: watch::Sender<AgentPhase>,
) -> Result<()> {
    let mut delay = INITIAL_BACKOFF;

    loop {
        let _ = phase_tx.send(AgentPhase::Connecting);
        info!("Connecting to gateway at {}", settings.ws_url());

        match connect_and_run(&settings, &handles, &mut outbound_rx, &phase_tx).await {
            Ok(()) => {
                info!("Connection closed, reconnecting");
                delay = INITIAL_BACKOFF;
            }
            Err(AgentError::Auth(message)) => {
                let _ = phase_tx.send(AgentPhase::Disconnected);
                return Err(AgentError::Auth(message));
            }
            Err(e) => {
                warn!("Connection error: {}, reconnecting in ~{:?}", e, delay);
            }
        }

        let _ = phase_tx.send(AgentPhase::Backoff);
        tokio::time::sleep(jittered(delay)).await;
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

/// Backoff with +/-50% jitter so a fleet does not reconnect in lockstep
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// One connection attempt: handshake, announce, then serve until disconnect
async fn connect_and_run(
    settings: &AgentSettings,
    handles: &ConnectionHandles,
    outbound_rx: &mut mpsc::Receiver<NodeFrame>,
    phase_tx: &watch::Sender<AgentPhase>,
) -> Result<()> {
    let mut request = settings.ws_url().into_client_request()?;
    let bearer: tungstenite::http::HeaderValue = format!("Bearer {}", settings.token)
        .parse()
        .map_err(|_| AgentError::Auth("token contains invalid header characters".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(map_connect_error)?;
    let (mut sink, mut stream) = ws.split();

    let _ = phase_tx.send(AgentPhase::Registered);
    send_frame(
        &mut sink,
        &NodeFrame::Connected {
            node_info: NodeInfo::capture(handles.skills.skill_ids()),
        },
    )
    .await?;

    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let status = HeartbeatStatus {
                    node_info: NodeInfo::capture(handles.skills.skill_ids()),
                    skill_health: handles.skills.probe_all(),
                    config_state: handles.config_state.read().await.clone(),
                };
                send_frame(&mut sink, &NodeFrame::Heartbeat { status }).await?;
                let _ = phase_tx.send(AgentPhase::Active);
            }

            queued = outbound_rx.recv() => {
                let Some(frame) = queued else { return Ok(()) };
                send_frame(&mut sink, &frame).await?;
            }

            incoming = stream.next() => {
                let Some(message) = incoming else {
                    return Ok(());
                };
                match message? {
                    Message::Text(text) => {
                        let frame = serde_json::from_str::<GatewayFrame>(&text).map_err(|e| {
                            // Unrecognized tags surface protocol drift; force
                            // a reconnect rather than ignore them.
                            AgentError::Connection(format!("protocol error: {}", e))
                        })?;
                        if let Some(reply) = dispatch(handles, frame).await {
                            send_frame(&mut sink, &reply).await?;
                        }
                    }
                    Message::Close(_) => {
                        info!("Gateway sent close frame");
                        return Ok(());
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        debug!("Transport keepalive");
                    }
                    Message::Binary(_) => {
                        return Err(AgentError::Connection(
                            "unexpected binary frame".to_string(),
                        ));
                    }
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Handle a gateway frame; a returned frame is the immediate reply
async fn dispatch(handles: &ConnectionHandles, frame: GatewayFrame) -> Option<NodeFrame> {
    match frame {
        GatewayFrame::TaskSubmit {
            task_id,
            goal,
            options,
        } => {
            if let Err(e) = handles.executor.submit(task_id, &goal, &options).await {
                warn!("Rejected task {}: {}", task_id, e);
            }
            None
        }
        GatewayFrame::TaskStop { task_id } => {
            handles.executor.stop(task_id).await;
            None
        }
        GatewayFrame::TaskMessage { task_id, message } => {
            handles.executor.message(task_id, message).await;
            None
        }
        GatewayFrame::ConfigPush => {
            // Queued onto the serial pull worker; validation runs out-of-band
            // from this loop.
            if handles.pull_trigger.try_send(()).is_err() {
                warn!("Config pull queue is full, dropping push");
            }
            None
        }
        GatewayFrame::Ping => Some(NodeFrame::Pong),
    }
}

async fn send_frame<S>(sink: &mut S, frame: &NodeFrame) -> Result<()>
where
    S: futures::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(AgentError::WebSocket)
}

fn map_connect_error(err: tungstenite::Error) -> AgentError {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || response.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            AgentError::Auth(format!("gateway rejected handshake: {}", response.status()))
        }
        other => AgentError::Connection(other.to_string()),
    }
}
