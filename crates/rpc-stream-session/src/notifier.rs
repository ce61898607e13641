//! Handle given to handlers for emitting progress on their own stream.

use std::sync::Arc;

use rpc_stream_core::{EventId, JsonRpcNotification, RequestId, StreamId};
use serde_json::Value;

use crate::{SessionRegistry, error::RelayError, stream::StreamEntry};

/// Emits notifications on the request stream a handler was invoked for.
///
/// A notifier can only reach its own stream: nothing a handler sends leaks to
/// the session's notification stream or to other requests. Calls are recorded
/// in the order they are made. After the response has been emitted every call
/// fails with [`RelayError::StreamClosed`].
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<SessionRegistry>,
    stream: Arc<StreamEntry>,
}

impl Notifier {
    pub(crate) const fn new(registry: Arc<SessionRegistry>, stream: Arc<StreamEntry>) -> Self {
        Self { registry, stream }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream.id
    }

    /// Id of the request being handled.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        self.stream.request_id()
    }

    /// Emit `method` with `params` as a notification.
    ///
    /// # Errors
    /// Returns [`RelayError::StreamClosed`] once the request has completed.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<EventId, RelayError> {
        self.send(JsonRpcNotification::new(method, params)).await
    }

    /// Emit a prepared notification.
    ///
    /// # Errors
    /// Returns [`RelayError::StreamClosed`] once the request has completed.
    pub async fn send(&self, notification: JsonRpcNotification) -> Result<EventId, RelayError> {
        let method = notification.method.clone();
        let result = self
            .registry
            .route_entry(&self.stream, notification.into())
            .await;
        if let Err(RelayError::StreamClosed(stream)) = &result {
            tracing::warn!(stream = %stream, method = %method, "notification after stream closed, dropped");
        }
        result
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("stream", &self.stream.id)
            .finish_non_exhaustive()
    }
}
