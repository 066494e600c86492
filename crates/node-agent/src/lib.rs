//! Node agent - the per-machine process that keeps an outbound link to the
//! gateway
//!
//! The agent owns the transport: a background reconnect loop maintains the
//! single WebSocket session, a queue decouples "business logic wants to send
//! a frame" from "the transport happens to be connected right now", and task
//! execution, config validation and skill health probes all run out-of-band
//! from the heartbeat loop.

pub mod agent;
pub mod client;
pub mod config_sync;
pub mod error;
pub mod executor;
pub mod skills;

pub use agent::{AgentPhase, AgentSettings, NodeAgent};
pub use error::{AgentError, Result};
