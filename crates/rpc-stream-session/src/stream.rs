//! Stream entries and transport attachments.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use rpc_stream_core::{Event, RequestId, SessionId, StreamId, StreamKind, StreamState};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Live connection bound to a stream.
pub(crate) struct TransportSlot {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Event>,
}

impl TransportSlot {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

/// Receiving end of a stream attachment.
///
/// Yields replayed events first, then live events. The channel ends when the
/// stream closes or another transport takes over the stream.
#[derive(Debug)]
pub struct Attachment {
    stream: StreamId,
    kind: StreamKind,
    transport_id: Uuid,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Attachment {
    pub(crate) const fn new(
        stream: StreamId,
        kind: StreamKind,
        transport_id: Uuid,
        receiver: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            stream,
            kind,
            transport_id,
            receiver,
        }
    }

    #[must_use]
    pub const fn stream(&self) -> StreamId {
        self.stream
    }

    #[must_use]
    pub const fn kind(&self) -> &StreamKind {
        &self.kind
    }

    /// Identifies this attachment for [`SessionRegistry::detach_transport`](crate::SessionRegistry::detach_transport).
    #[must_use]
    pub const fn transport_id(&self) -> Uuid {
        self.transport_id
    }

    /// Next event, or `None` once the stream is closed or taken over.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Convert into a `futures::Stream` of events.
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<Event> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

pub(crate) struct StreamInner {
    pub state: StreamState,
    pub transport: Option<TransportSlot>,
    pub detached_at: Option<Instant>,
}

impl StreamInner {
    /// Bind a fresh transport, replacing any previous one.
    pub fn attach(&mut self) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let (slot, rx) = TransportSlot::new();
        let id = slot.id;
        if self.transport.replace(slot).is_some() {
            tracing::debug!(transport = %id, "replacing previous transport");
        }
        self.state = StreamState::Open;
        self.detached_at = None;
        (id, rx)
    }

    pub fn detach(&mut self, now: Instant) {
        self.transport = None;
        if self.state == StreamState::Open {
            self.state = StreamState::Detached;
            self.detached_at = Some(now);
        }
    }

    pub fn close(&mut self) {
        self.transport = None;
        self.state = StreamState::Closed;
    }

    /// Attached to a transport whose receiver is still alive.
    pub fn is_attached(&self) -> bool {
        self.transport.as_ref().is_some_and(|slot| !slot.tx.is_closed())
    }

    /// Hand `event` to the live transport, detaching if the receiver is gone.
    pub fn deliver(&mut self, event: Event) {
        let Some(slot) = &self.transport else {
            return;
        };
        if slot.tx.send(event).is_err() {
            tracing::debug!(transport = %slot.id, "transport gone, detaching");
            self.detach(Instant::now());
        }
    }
}

/// Mutable per-session bookkeeping, guarded by a short-lived std mutex.
pub(crate) struct SessionState {
    pub streams: HashSet<StreamId>,
    pub persistent: Option<StreamId>,
    pub last_activity: Instant,
    pub in_flight: usize,
    pub torn_down: bool,
}

pub(crate) struct SessionEntry {
    pub id: SessionId,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                streams: HashSet::new(),
                persistent: None,
                last_activity: Instant::now(),
                in_flight: 0,
                torn_down: false,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }
}

/// A stream tracked by the registry.
///
/// `inner` is a fair async mutex: it serializes sequence assignment and
/// delivery for this stream in call order while other streams proceed.
pub(crate) struct StreamEntry {
    pub id: StreamId,
    pub kind: StreamKind,
    pub session: std::sync::Arc<SessionEntry>,
    pub inner: tokio::sync::Mutex<StreamInner>,
}

impl StreamEntry {
    pub fn new(id: StreamId, kind: StreamKind, session: std::sync::Arc<SessionEntry>) -> Self {
        Self {
            id,
            kind,
            session,
            inner: tokio::sync::Mutex::new(StreamInner {
                state: StreamState::Open,
                transport: None,
                detached_at: None,
            }),
        }
    }

    pub const fn request_id(&self) -> Option<&RequestId> {
        match &self.kind {
            StreamKind::Request { request_id } => Some(request_id),
            StreamKind::Notification => None,
        }
    }
}
