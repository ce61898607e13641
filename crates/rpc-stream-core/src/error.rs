//! Event store errors.

use thiserror::Error;

use crate::ids::{EventId, StreamId};

/// Event store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The stream is unknown, or its log no longer reaches back to this event.
    #[error("event {0} is unknown or has been evicted")]
    NotFound(EventId),
    /// The stream already recorded its terminal event.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),
}
