//! Relay error taxonomy.

use rpc_stream_core::{EventId, SessionId, StoreError, StreamId, StreamKind};
use thiserror::Error;

/// Errors raised by the registry, dispatcher and reconnect handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A message arrived after the stream's terminal response or teardown.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),
    /// The event id is unknown or has been evicted.
    #[error("event {0} is unknown or has been evicted")]
    NotFound(EventId),
    /// The event id belongs to a stream owned by another session.
    #[error("event {event_id} belongs to a different session")]
    Forbidden { event_id: EventId },
    /// The session no longer exists.
    #[error("session {0} has been torn down")]
    SessionTornDown(SessionId),
    /// The session already has a live notification stream.
    #[error("session {0} already has an attached notification stream")]
    Conflict(SessionId),
    /// Reconnection is impossible because the buffered events are gone.
    #[error("cannot resume after event {event_id}: {}", unresumable_hint(.kind.as_ref()))]
    Unresumable {
        event_id: EventId,
        kind: Option<StreamKind>,
    },
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::StreamClosed(id) => Self::StreamClosed(id),
        }
    }
}

/// What a client should do after an unresumable reconnect.
#[must_use]
pub fn unresumable_hint(kind: Option<&StreamKind>) -> &'static str {
    match kind {
        Some(StreamKind::Request { .. }) => {
            "the outcome of the original request is unknown; do not assume success or failure"
        }
        Some(StreamKind::Notification) => "open a new notification stream",
        None => "the stream is unknown; treat any request on it as having an unknown outcome",
    }
}
