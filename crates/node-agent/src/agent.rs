//! Agent assembly and connection state machine

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::client;
use crate::config_sync::{self, ConfigPuller, SharedConfigState};
use crate::error::{AgentError, Result};
use crate::executor::TaskExecutor;
use crate::skills::SkillSet;

/// Connectivity phase of the agent
///
/// There is no terminal failure state: the agent retries indefinitely with
/// capped backoff, because it is expected to eventually become reachable
/// again without operator intervention. The one exception is a rejected
/// token, which aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Disconnected,
    Connecting,
    Registered,
    Active,
    Backoff,
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub node_id: String,
    /// Gateway base URL, `ws://` or `wss://`
    pub gateway_url: String,
    pub token: String,
    pub heartbeat_interval: Duration,
}

impl AgentSettings {
    /// WebSocket endpoint for the transport handshake
    pub fn ws_url(&self) -> String {
        format!(
            "{}/gateway/ws?nodeId={}",
            self.gateway_url.trim_end_matches('/'),
            self.node_id
        )
    }

    /// HTTP base derived from the gateway URL, for the config pull
    pub fn http_base(&self) -> Result<String> {
        let base = self.gateway_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("wss://") {
            Ok(format!("https://{}", rest))
        } else if let Some(rest) = base.strip_prefix("ws://") {
            Ok(format!("http://{}", rest))
        } else {
            Err(AgentError::InvalidSettings(format!(
                "gateway url must start with ws:// or wss://, got {}",
                self.gateway_url
            )))
        }
    }

    pub fn config_url(&self) -> Result<String> {
        Ok(format!(
            "{}/api/nodes/{}/config",
            self.http_base()?,
            self.node_id
        ))
    }
}

/// The per-machine agent process
pub struct NodeAgent {
    settings: AgentSettings,
    skills: SkillSet,
}

impl NodeAgent {
    pub fn new(settings: AgentSettings, skills: SkillSet) -> Self {
        Self { settings, skills }
    }

    /// Run until a fatal error (today: only a rejected token)
    pub async fn run(self) -> Result<()> {
        // The outbound queue decouples frame producers from connection state:
        // executor and config worker enqueue regardless of whether the
        // transport is currently up.
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let config_state: SharedConfigState = SharedConfigState::default();

        let executor = Arc::new(TaskExecutor::new(outbound_tx.clone()));
        let puller = ConfigPuller::new(self.settings.config_url()?, self.settings.token.clone());
        let pull_trigger = config_sync::spawn_worker(
            puller,
            self.skills.clone(),
            outbound_tx.clone(),
            Arc::clone(&config_state),
        );

        let (phase_tx, _phase_rx) = watch::channel(AgentPhase::Disconnected);

        client::run_connection_loop(
            self.settings,
            client::ConnectionHandles {
                executor,
                pull_trigger,
                skills: self.skills,
                config_state,
            },
            outbound_rx,
            phase_tx,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> AgentSettings {
        AgentSettings {
            node_id: "node-a".to_string(),
            gateway_url: url.to_string(),
            token: "tok".to_string(),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_ws_url_carries_node_id() {
        let s = settings("ws://gateway.example:8080");
        assert_eq!(
            s.ws_url(),
            "ws://gateway.example:8080/gateway/ws?nodeId=node-a"
        );
    }

    #[test]
    fn test_http_base_derivation() {
        assert_eq!(
            settings("ws://gw:8080").http_base().unwrap(),
            "http://gw:8080"
        );
        assert_eq!(
            settings("wss://gw.example").http_base().unwrap(),
            "https://gw.example"
        );
        assert!(settings("http://gw").http_base().is_err());
    }

    #[test]
    fn test_config_url() {
        assert_eq!(
            settings("ws://gw:8080").config_url().unwrap(),
            "http://gw:8080/api/nodes/node-a/config"
        );
    }
}
