//! HTTP mapping for control-plane errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_core::Error;

/// Wrapper turning [`fleet_core::Error`] into an HTTP response
///
/// Every externally visible failure carries kind + message so the caller can
/// distinguish "retry me" from "fix configuration and resubmit".
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn kind(err: &Error) -> &'static str {
    match err {
        Error::Connection(_) => "connection",
        Error::Auth(_) => "auth",
        Error::Validation { .. } => "validation",
        Error::NodeOffline(_) => "node_offline",
        Error::ConfigDelivery(_) => "config_delivery",
        Error::Protocol(_) => "protocol",
        Error::TaskNotFound(_) => "task_not_found",
        Error::NodeNotFound(_) => "node_not_found",
        Error::InvalidInput(_) => "invalid_input",
        Error::Storage(_) => "storage",
        Error::Io(_) => "io",
        Error::Serialization(_) => "serialization",
    }
}

fn status(err: &Error) -> StatusCode {
    match err {
        Error::NodeOffline(_) | Error::ConfigDelivery(_) | Error::Connection(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::TaskNotFound(_) | Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) | Error::Validation { .. } | Error::Protocol(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "kind": kind(&self.0),
                "message": self.0.to_string(),
                "retryable": self.0.is_retryable(),
            }
        });
        (status(&self.0), Json(body)).into_response()
    }
}
