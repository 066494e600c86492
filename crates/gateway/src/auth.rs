//! Request authentication helpers
//!
//! Two authentication surfaces exist: the per-node bearer token (WS handshake
//! and the node's own config pull) and the static service-to-service shared
//! secret carried in the `x-service-token` header. Per-user session cookies
//! never reach the gateway.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use fleet_core::{Error, Result};

use crate::state::AppState;

pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// Extract the bearer token from an Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::Auth("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| Error::Auth("invalid Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::Auth("Authorization must be a Bearer token".to_string()))
}

/// Require the service-to-service shared secret
pub fn require_service_token(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let presented = headers
        .get(SERVICE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Auth(format!("missing {} header", SERVICE_TOKEN_HEADER)))?;

    if presented != state.service_token() {
        return Err(Error::Auth("invalid service token".to_string()));
    }
    Ok(())
}

/// Authorize a config read: either the service secret or the node's own
/// bearer token (the pull path a node follows after `config:push`)
pub async fn authorize_config_read(
    state: &AppState,
    node_id: &str,
    headers: &HeaderMap,
) -> Result<()> {
    if require_service_token(state, headers).is_ok() {
        return Ok(());
    }
    let token = extract_bearer_token(headers)?;
    state.node_store().verify_token(node_id, token).await?;
    Ok(())
}
