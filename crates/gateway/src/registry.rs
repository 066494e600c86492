//! Connection registry - the single source of truth for "which node is
//! reachable right now"
//!
//! At most one session is registered per node id at any instant. Registering
//! a new session for an already-present id closes the prior session before
//! installing the new one; both steps happen inside the registry's write-lock
//! critical section so concurrent registration attempts for the same id are
//! serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_core::node::HeartbeatStatus;
use fleet_core::protocol::GatewayFrame;
use fleet_core::{Error, Result};

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The transport closed or errored
    TransportClosed,
    /// No heartbeat within the staleness window
    HeartbeatTimeout,
    /// Gateway shutdown
    Shutdown,
}

/// Handle to one node's live transport session
///
/// Cloning hands out another handle to the same underlying session; the
/// outbound queue and the close signal are shared.
#[derive(Clone)]
pub struct NodeSession {
    pub node_id: String,
    /// Distinguishes this session from a successor for the same node
    pub session_id: Uuid,
    pub connected_at: Instant,
    tx: mpsc::Sender<GatewayFrame>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl NodeSession {
    pub fn new(node_id: impl Into<String>, tx: mpsc::Sender<GatewayFrame>) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            session_id: Uuid::new_v4(),
            connected_at: Instant::now(),
            tx,
            close_tx: Arc::new(close_tx),
        }
    }

    /// Queue a frame for delivery over this session's transport
    pub async fn send(&self, frame: GatewayFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Connection(format!("session for {} is closed", self.node_id)))
    }

    /// Subscribe to the close signal. The socket loop selects on this and
    /// terminates once it flips to `true`.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Signal the owning socket loop to terminate
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether the close signal has been raised
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }
}

struct SessionEntry {
    session: NodeSession,
    last_heartbeat: Instant,
    last_status: Option<HeartbeatStatus>,
}

/// Liveness snapshot for one connected node, for API responses
#[derive(Clone)]
pub struct SessionSnapshot {
    pub node_id: String,
    pub connected_for: Duration,
    pub last_heartbeat_age: Duration,
    pub last_status: Option<HeartbeatStatus>,
}

/// In-memory map from node identity to its single active transport session
///
/// Constructed explicitly and passed to every component that needs it, so
/// tests can instantiate isolated registries. Entries have no existence
/// beyond process lifetime; reachability after a restart is re-derived from
/// fresh connections.
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Install a session, closing and discarding any prior session for the
    /// same node first
    pub async fn register(&self, session: NodeSession) {
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.remove(&session.node_id) {
            warn!(
                "Node {} already has a session, closing the old one",
                session.node_id
            );
            previous.session.close();
        }

        info!("Registered session for node {}", session.node_id);
        sessions.insert(
            session.node_id.clone(),
            SessionEntry {
                session,
                last_heartbeat: Instant::now(),
                last_status: None,
            },
        );
    }

    /// Look up the live session for a node
    pub async fn lookup(&self, node_id: &str) -> Option<NodeSession> {
        let sessions = self.sessions.read().await;
        sessions.get(node_id).map(|entry| entry.session.clone())
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.read().await.contains_key(node_id)
    }

    /// Record a heartbeat for a node, replacing the previous status report
    pub async fn touch(&self, node_id: &str, status: Option<HeartbeatStatus>) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(node_id) {
            entry.last_heartbeat = Instant::now();
            if status.is_some() {
                entry.last_status = status;
            }
            debug!("Heartbeat from node {}", node_id);
        }
    }

    /// Remove a node's session and close it
    ///
    /// Eviction only prevents new routing to the node; tasks already in a
    /// terminal state are untouched.
    pub async fn evict(&self, node_id: &str, reason: EvictReason) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(node_id) {
            Some(entry) => {
                entry.session.close();
                info!("Evicted session for node {} ({:?})", node_id, reason);
                true
            }
            None => false,
        }
    }

    /// Remove a session only if it is still the current one for its node
    ///
    /// Called by a terminating socket loop; a loop whose session was already
    /// superseded must not evict its successor.
    pub async fn remove_if_current(&self, node_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(node_id)
            .is_some_and(|entry| entry.session.session_id == session_id)
        {
            if let Some(entry) = sessions.remove(node_id) {
                entry.session.close();
            }
            info!("Session for node {} removed on transport close", node_id);
            return true;
        }
        false
    }

    /// Evict every session without a heartbeat in the last `ttl`
    ///
    /// Returns the ids of the evicted nodes.
    pub async fn sweep_stale(&self, ttl: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let mut evicted = Vec::new();

        sessions.retain(|node_id, entry| {
            if now.duration_since(entry.last_heartbeat) > ttl {
                warn!("Node {} heartbeat timeout, evicting", node_id);
                entry.session.close();
                evicted.push(node_id.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Liveness snapshots for all connected nodes
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        sessions
            .values()
            .map(|entry| SessionSnapshot {
                node_id: entry.session.node_id.clone(),
                connected_for: now.duration_since(entry.session.connected_at),
                last_heartbeat_age: now.duration_since(entry.last_heartbeat),
                last_status: entry.last_status.clone(),
            })
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session. Used on gateway shutdown.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, entry) in sessions.drain() {
            entry.session.close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background staleness checker
///
/// Ticks every `interval` and evicts sessions without a heartbeat in the last
/// `ttl` (3 x the heartbeat interval by convention). Gateway `ping` frames are
/// sent on the same tick as a transport nudge; they do not count as
/// heartbeats.
pub fn start_staleness_checker(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = registry.sweep_stale(ttl).await;
            if !evicted.is_empty() {
                info!("Staleness sweep evicted {} node(s)", evicted.len());
            }

            let sessions = registry.sessions.read().await;
            for entry in sessions.values() {
                let _ = entry.session.tx.try_send(GatewayFrame::Ping);
            }
        }
    })
}
