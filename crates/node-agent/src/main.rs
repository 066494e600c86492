//! Node agent entry point

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use node_agent::agent::{AgentSettings, NodeAgent};
use node_agent::skills::SkillSet;

#[derive(Debug, Parser)]
#[command(
    name = "node-agent",
    about = "Fleet node agent - keeps an outbound link to the gateway"
)]
struct Args {
    /// Gateway base URL (ws:// or wss://)
    #[arg(long, env = "FLEET_GATEWAY_URL", default_value = "ws://127.0.0.1:8080")]
    gateway_url: String,

    /// Stable node identity assigned at registration
    #[arg(long, env = "FLEET_NODE_ID")]
    node_id: String,

    /// Bearer token issued at registration
    #[arg(long, env = "FLEET_NODE_TOKEN")]
    token: String,

    /// Heartbeat interval in seconds
    #[arg(long, env = "FLEET_HEARTBEAT_SECS", default_value_t = 15)]
    heartbeat_secs: u64,

    /// Path to a skill manifest file (JSON); defaults to the built-in set
    #[arg(long, env = "FLEET_SKILLS_FILE")]
    skills_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let skills = match &args.skills_file {
        Some(path) => SkillSet::load(path).await?,
        None => SkillSet::builtin(),
    };
    tracing::info!("Loaded skills: {:?}", skills.skill_ids());

    let agent = NodeAgent::new(
        AgentSettings {
            node_id: args.node_id,
            gateway_url: args.gateway_url,
            token: args.token,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        },
        skills,
    );

    tokio::select! {
        result = agent.run() => {
            // Only a fatal auth rejection ends the run.
            result?;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
