//! Stream kinds and lifecycle states.

use serde::{Deserialize, Serialize};

use crate::jsonrpc::RequestId;

/// What a stream carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamKind {
    /// Bound to one request; closes right after its response.
    Request { request_id: RequestId },
    /// Long-lived, carries only server-initiated messages.
    Notification,
}

impl StreamKind {
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Notification)
    }

    /// Short label for logs and error bodies.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Notification => "notification",
        }
    }
}

/// Stream lifecycle.
///
/// `Open` and `Detached` alternate as transports come and go; `Closed` is
/// terminal and only reached by request streams after their response, or by
/// any stream on session teardown or idle eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Open,
    Detached,
    Closed,
}
