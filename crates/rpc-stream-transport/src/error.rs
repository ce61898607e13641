//! HTTP mapping of relay failures.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rpc_stream_core::{JsonRpcError, SessionId};
use rpc_stream_session::{RelayError, unresumable_hint};
use serde_json::json;
use thiserror::Error;

/// Anything a route can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing x-session-id header")]
    MissingSession,
    #[error("malformed x-session-id header")]
    MalformedSession,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("malformed Last-Event-ID {0:?}")]
    MalformedEventId(String),
    #[error("client accepts neither application/json nor text/event-stream")]
    NotAcceptable,
    /// Body rejected before dispatch; answered with a JSON-RPC error object.
    #[error("{}", .0.message)]
    Rpc(JsonRpcError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingSession => StatusCode::UNAUTHORIZED,
            Self::MalformedSession | Self::MalformedEventId(_) | Self::Rpc(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::Relay(err) => match err {
                RelayError::Forbidden { .. } => StatusCode::FORBIDDEN,
                RelayError::Conflict(_) => StatusCode::CONFLICT,
                RelayError::StreamClosed(_) => StatusCode::GONE,
                RelayError::NotFound(_)
                | RelayError::SessionTornDown(_)
                | RelayError::Unresumable { .. } => StatusCode::NOT_FOUND,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::debug!(status = status.as_u16(), "{self}");
        }

        let body = match &self {
            Self::Rpc(error) => json!({ "jsonrpc": "2.0", "id": null, "error": error }),
            Self::Relay(RelayError::Unresumable { event_id, kind }) => json!({
                "error": self.to_string(),
                "event_id": event_id,
                "kind": kind.as_ref().map(|k| k.label()),
                "hint": unresumable_hint(kind.as_ref()),
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
