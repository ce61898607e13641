//! Session and stream registry.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use rpc_stream_core::{
    EventId, EventStore, JsonRpcMessage, JsonRpcNotification, JsonRpcResponse, RelayConfig,
    SessionId, StreamId, StreamKind, StreamState,
};
use tokio::{sync::RwLock, time::MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::RelayError,
    stream::{Attachment, SessionEntry, StreamEntry},
};

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Streams whose transport had gone away.
    pub detached: usize,
    /// Notification streams closed after sitting detached too long.
    pub closed_streams: usize,
    /// Sessions torn down for inactivity.
    pub torn_down_sessions: usize,
}

/// Tracks sessions, their streams and live transports, and routes messages.
///
/// Every routed message is appended to the [`EventStore`] before it is handed
/// to a transport, so any id a client sees can be resumed from.
pub struct SessionRegistry {
    store: Arc<EventStore>,
    config: RelayConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    streams: RwLock<HashMap<StreamId, Arc<StreamEntry>>>,
}

impl SessionRegistry {
    /// Create a registry with its own event store.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let store = Arc::new(EventStore::new(&config));
        Self::with_store(config, store)
    }

    /// Create a registry over an existing event store.
    #[must_use]
    pub fn with_store(config: RelayConfig, store: Arc<EventStore>) -> Self {
        Self {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Create a session with a fresh id.
    pub async fn create_session(&self) -> SessionId {
        let id = SessionId::new();
        self.register_session(id).await;
        id
    }

    /// Register a session id issued elsewhere. Returns false if it already exists.
    pub async fn register_session(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, Arc::new(SessionEntry::new(id)));
        info!(session = %id, "session created");
        true
    }

    pub async fn has_session(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Record client activity on a session.
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] if the session does not exist.
    pub async fn touch_session(&self, id: SessionId) -> Result<(), RelayError> {
        self.session(id).await?.touch();
        Ok(())
    }

    pub(crate) async fn session(&self, id: SessionId) -> Result<Arc<SessionEntry>, RelayError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RelayError::SessionTornDown(id))
    }

    pub(crate) async fn stream_entry(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        self.streams.read().await.get(&id).cloned()
    }

    /// Current state of a live stream; `None` once it is closed and unlinked.
    pub async fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        let entry = self.stream_entry(id).await?;
        let inner = entry.inner.lock().await;
        Some(inner.state)
    }

    /// Create a stream owned by `session`.
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] for unknown sessions and
    /// [`RelayError::Conflict`] when asking for a second notification stream
    /// while the first is still attached.
    pub async fn create_stream(
        &self,
        session: SessionId,
        kind: StreamKind,
    ) -> Result<StreamId, RelayError> {
        self.open_stream(session, kind).await.map(|entry| entry.id)
    }

    pub(crate) async fn open_stream(
        &self,
        session: SessionId,
        kind: StreamKind,
    ) -> Result<Arc<StreamEntry>, RelayError> {
        let owner = self.session(session).await?;
        if kind.is_persistent() {
            self.retire_detached_notification_stream(&owner).await?;
        }

        let id = StreamId::new();
        {
            let mut state = owner.state();
            if state.torn_down {
                return Err(RelayError::SessionTornDown(session));
            }
            match kind {
                StreamKind::Notification => {
                    if state.persistent.is_some() {
                        return Err(RelayError::Conflict(session));
                    }
                    state.persistent = Some(id);
                }
                StreamKind::Request { .. } => state.in_flight += 1,
            }
            state.streams.insert(id);
            state.last_activity = Instant::now();
        }

        self.store.open_stream(id, session, kind.clone());
        let entry = Arc::new(StreamEntry::new(id, kind, Arc::clone(&owner)));
        self.streams.write().await.insert(id, Arc::clone(&entry));

        // Teardown may have run between bookkeeping and insertion.
        let torn_down = owner.state().torn_down;
        if torn_down {
            self.discard(&entry).await;
            return Err(RelayError::SessionTornDown(session));
        }

        debug!(session = %session, stream = %id, kind = entry.kind.label(), "stream created");
        Ok(entry)
    }

    /// Make room for a new notification stream by closing a detached one.
    async fn retire_detached_notification_stream(
        &self,
        owner: &SessionEntry,
    ) -> Result<(), RelayError> {
        let existing = owner.state().persistent;
        let Some(existing) = existing else {
            return Ok(());
        };
        let Some(entry) = self.stream_entry(existing).await else {
            let mut state = owner.state();
            if state.persistent == Some(existing) {
                state.persistent = None;
            }
            return Ok(());
        };

        let mut inner = entry.inner.lock().await;
        if inner.is_attached() {
            return Err(RelayError::Conflict(owner.id));
        }
        if inner.state != StreamState::Closed {
            inner.close();
            drop(inner);
            self.discard(&entry).await;
            info!(session = %owner.id, stream = %existing, "replacing detached notification stream");
        }
        Ok(())
    }

    /// Open the session's notification stream and attach to it.
    ///
    /// # Errors
    /// See [`SessionRegistry::create_stream`].
    pub async fn open_notification_stream(
        &self,
        session: SessionId,
    ) -> Result<Attachment, RelayError> {
        let entry = self.open_stream(session, StreamKind::Notification).await?;
        let mut inner = entry.inner.lock().await;
        if inner.state == StreamState::Closed {
            return Err(RelayError::Conflict(session));
        }
        let (transport_id, rx) = inner.attach();
        Ok(Attachment::new(entry.id, entry.kind.clone(), transport_id, rx))
    }

    /// Bind a new transport to `stream`, replacing any existing one.
    ///
    /// # Errors
    /// Returns [`RelayError::StreamClosed`] if the stream is closed or unknown.
    pub async fn attach(&self, stream: StreamId) -> Result<Attachment, RelayError> {
        let entry = self
            .stream_entry(stream)
            .await
            .ok_or(RelayError::StreamClosed(stream))?;
        let mut inner = entry.inner.lock().await;
        if inner.state == StreamState::Closed {
            return Err(RelayError::StreamClosed(stream));
        }
        let (transport_id, rx) = inner.attach();
        entry.session.touch();
        Ok(Attachment::new(stream, entry.kind.clone(), transport_id, rx))
    }

    /// Unbind whatever transport is attached to `stream`.
    pub async fn detach(&self, stream: StreamId) {
        if let Some(entry) = self.stream_entry(stream).await {
            entry.inner.lock().await.detach(Instant::now());
            debug!(stream = %stream, "stream detached");
        }
    }

    /// Unbind `transport_id` if it is still the attached transport.
    pub async fn detach_transport(&self, stream: StreamId, transport_id: Uuid) {
        let Some(entry) = self.stream_entry(stream).await else {
            return;
        };
        let mut inner = entry.inner.lock().await;
        if inner.transport.as_ref().is_some_and(|slot| slot.id == transport_id) {
            inner.detach(Instant::now());
            debug!(stream = %stream, transport = %transport_id, "transport disconnected");
        }
    }

    /// Record `message` on `stream` and deliver it live if a transport is attached.
    ///
    /// Terminal responses of request streams go through the dispatcher, which
    /// also closes the stream.
    ///
    /// # Errors
    /// Returns [`RelayError::StreamClosed`] if the stream is closed or unknown.
    pub async fn route(
        &self,
        stream: StreamId,
        message: JsonRpcMessage,
    ) -> Result<EventId, RelayError> {
        let entry = self
            .stream_entry(stream)
            .await
            .ok_or(RelayError::StreamClosed(stream))?;
        self.route_entry(&entry, message).await
    }

    pub(crate) async fn route_entry(
        &self,
        entry: &StreamEntry,
        message: JsonRpcMessage,
    ) -> Result<EventId, RelayError> {
        let mut inner = entry.inner.lock().await;
        if inner.state == StreamState::Closed {
            return Err(RelayError::StreamClosed(entry.id));
        }
        let event = self.store.append_event(entry.id, message)?;
        let id = event.id;
        inner.deliver(event);
        debug!(event_id = %id, "routed");
        Ok(id)
    }

    /// Record the terminal response of a request stream, then close it.
    pub(crate) async fn complete(
        &self,
        entry: &StreamEntry,
        response: JsonRpcResponse,
    ) -> Result<EventId, RelayError> {
        let mut inner = entry.inner.lock().await;
        if inner.state == StreamState::Closed {
            return Err(RelayError::StreamClosed(entry.id));
        }
        let recorded = self
            .store
            .append_event(entry.id, response.into())
            .map(|event| {
                let id = event.id;
                inner.deliver(event);
                id
            })
            .map_err(RelayError::from);
        self.store.seal(entry.id);
        self.unlink(entry).await;
        // Dropping the transport ends the attachment once the response is read.
        inner.close();
        drop(inner);
        debug!(stream = %entry.id, "stream closed after response");
        recorded
    }

    /// Send a server-initiated notification to the session's notification stream.
    ///
    /// Returns `None` when the session has no notification stream.
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] if the session does not exist.
    pub async fn notify_session(
        &self,
        session: SessionId,
        notification: JsonRpcNotification,
    ) -> Result<Option<EventId>, RelayError> {
        let owner = self.session(session).await?;
        let persistent = owner.state().persistent;
        let Some(stream) = persistent else {
            debug!(session = %session, method = %notification.method, "no notification stream, dropping");
            return Ok(None);
        };
        match self.route(stream, notification.into()).await {
            Ok(id) => Ok(Some(id)),
            Err(RelayError::StreamClosed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send a notification to every session's notification stream.
    /// Returns how many sessions recorded it.
    pub async fn notify_all(&self, notification: &JsonRpcNotification) -> usize {
        let sessions: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        let mut recorded = 0;
        for session in sessions {
            if let Ok(Some(_)) = self.notify_session(session, notification.clone()).await {
                recorded += 1;
            }
        }
        recorded
    }

    /// Destroy a session: close all of its streams and drop their events.
    ///
    /// In-flight handlers keep running; whatever they emit afterwards is
    /// rejected with [`RelayError::StreamClosed`].
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] if the session does not exist.
    pub async fn teardown_session(&self, session: SessionId) -> Result<(), RelayError> {
        let owner = self
            .sessions
            .write()
            .await
            .remove(&session)
            .ok_or(RelayError::SessionTornDown(session))?;

        let stream_ids: Vec<StreamId> = {
            let mut state = owner.state();
            state.torn_down = true;
            state.streams.iter().copied().collect()
        };

        let mut closed = 0;
        for id in stream_ids {
            let Some(entry) = self.stream_entry(id).await else {
                continue;
            };
            let mut inner = entry.inner.lock().await;
            if inner.state != StreamState::Closed {
                inner.close();
                closed += 1;
            }
            drop(inner);
            self.unlink(&entry).await;
        }
        self.store.forget_session(session);

        info!(session = %session, streams = closed, "session torn down");
        Ok(())
    }

    /// Detach dead transports, close notification streams left detached past
    /// their idle timeout, and tear down idle sessions.
    pub async fn sweep_idle(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let stream_timeout = self.config.persistent_idle_timeout();
        let session_timeout = self.config.session_idle_timeout();

        let entries: Vec<Arc<StreamEntry>> =
            self.streams.read().await.values().cloned().collect();
        let mut live_sessions = HashSet::new();

        for entry in entries {
            let mut inner = entry.inner.lock().await;
            if inner.is_attached() {
                live_sessions.insert(entry.session.id);
                continue;
            }
            // Only a dead transport counts; JSON-mode request streams never had one.
            if inner.state == StreamState::Open && inner.transport.is_some() {
                inner.detach(now);
                report.detached += 1;
            }

            let expired = entry.kind.is_persistent()
                && inner.state == StreamState::Detached
                && inner
                    .detached_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= stream_timeout);
            if expired {
                inner.close();
                drop(inner);
                self.discard(&entry).await;
                report.closed_streams += 1;
                info!(session = %entry.session.id, stream = %entry.id, "idle notification stream closed");
            }
        }

        let idle: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|owner| {
                if live_sessions.contains(&owner.id) {
                    return false;
                }
                let state = owner.state();
                state.in_flight == 0
                    && now.saturating_duration_since(state.last_activity) >= session_timeout
            })
            .map(|owner| owner.id)
            .collect();

        for session in idle {
            if self.teardown_session(session).await.is_ok() {
                report.torn_down_sessions += 1;
            }
        }
        report
    }

    /// Run [`SessionRegistry::sweep_idle`] every `sweep_interval`.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep_idle(Instant::now()).await;
                if report != SweepReport::default() {
                    debug!(?report, "idle sweep");
                }
            }
        })
    }

    /// Drop a closed stream's events and unlink it.
    async fn discard(&self, entry: &StreamEntry) {
        self.store.forget(entry.id);
        self.unlink(entry).await;
    }

    /// Remove a closed stream from the registry maps.
    async fn unlink(&self, entry: &StreamEntry) {
        self.streams.write().await.remove(&entry.id);
        let mut state = entry.session.state();
        if state.streams.remove(&entry.id) && !entry.kind.is_persistent() {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if state.persistent == Some(entry.id) {
            state.persistent = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rpc_stream_core::RequestId;
    use serde_json::json;

    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(RelayConfig::default())
    }

    fn note(n: u64) -> JsonRpcMessage {
        JsonRpcNotification::new("progress", Some(json!({ "n": n }))).into()
    }

    fn request(id: i64) -> StreamKind {
        StreamKind::Request {
            request_id: RequestId::Number(id),
        }
    }

    #[tokio::test]
    async fn route_records_before_delivering() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        let mut attachment = reg.attach(stream).await.unwrap();

        let id = reg.route(stream, note(1)).await.unwrap();
        let delivered = attachment.recv().await.unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(reg.store().history(stream).len(), 1);
    }

    #[tokio::test]
    async fn route_without_transport_only_records() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();

        let id = reg.route(stream, note(1)).await.unwrap();
        assert_eq!(id.sequence, 1);
        assert_eq!(reg.store().history(stream)[0].id, id);
    }

    #[tokio::test]
    async fn dropped_receiver_detaches_on_next_route() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        drop(reg.attach(stream).await.unwrap());

        reg.route(stream, note(1)).await.unwrap();
        assert_eq!(reg.stream_state(stream).await, Some(StreamState::Detached));
    }

    #[tokio::test]
    async fn second_attach_replaces_first() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        let mut first = reg.attach(stream).await.unwrap();
        let mut second = reg.attach(stream).await.unwrap();

        reg.route(stream, note(1)).await.unwrap();
        assert!(first.recv().await.is_none());
        assert_eq!(second.recv().await.unwrap().id.sequence, 1);
    }

    #[tokio::test]
    async fn stale_transport_detach_is_ignored() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        let first = reg.attach(stream).await.unwrap();
        let mut second = reg.attach(stream).await.unwrap();

        reg.detach_transport(stream, first.transport_id()).await;
        reg.route(stream, note(1)).await.unwrap();
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn one_attached_notification_stream_per_session() {
        let reg = registry();
        let session = reg.create_session().await;
        let _live = reg.open_notification_stream(session).await.unwrap();

        let err = reg.open_notification_stream(session).await.unwrap_err();
        assert_eq!(err, RelayError::Conflict(session));
    }

    #[tokio::test]
    async fn detached_notification_stream_is_replaced() {
        let reg = registry();
        let session = reg.create_session().await;
        let old = reg.open_notification_stream(session).await.unwrap();
        let old_stream = old.stream();
        drop(old);
        reg.detach(old_stream).await;

        let new = reg.open_notification_stream(session).await.unwrap();
        assert_ne!(new.stream(), old_stream);
        assert!(reg.stream_state(old_stream).await.is_none());
        assert!(reg.store().stream_info(old_stream).is_none());
    }

    #[tokio::test]
    async fn notify_session_targets_only_the_notification_stream() {
        let reg = registry();
        let session = reg.create_session().await;
        let request_stream = reg.create_stream(session, request(1)).await.unwrap();
        let mut persistent = reg.open_notification_stream(session).await.unwrap();

        let id = reg
            .notify_session(session, JsonRpcNotification::new("tick", None))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(id.stream, persistent.stream());
        assert_eq!(persistent.recv().await.unwrap().id, id);
        assert!(reg.store().history(request_stream).is_empty());
    }

    #[tokio::test]
    async fn notify_session_without_stream_is_dropped() {
        let reg = registry();
        let session = reg.create_session().await;
        let outcome = reg
            .notify_session(session, JsonRpcNotification::new("tick", None))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn notify_all_reaches_every_notification_stream() {
        let reg = registry();
        let a = reg.create_session().await;
        let b = reg.create_session().await;
        let _c = reg.create_session().await;
        let _sa = reg.open_notification_stream(a).await.unwrap();
        let _sb = reg.open_notification_stream(b).await.unwrap();

        let recorded = reg
            .notify_all(&JsonRpcNotification::new("tick", None))
            .await;
        assert_eq!(recorded, 2);
    }

    #[tokio::test]
    async fn teardown_closes_streams_and_evicts_events() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        let mut attachment = reg.attach(stream).await.unwrap();
        reg.route(stream, note(1)).await.unwrap();

        reg.teardown_session(session).await.unwrap();

        assert!(attachment.recv().await.is_some());
        assert!(attachment.recv().await.is_none());
        assert_eq!(
            reg.route(stream, note(2)).await,
            Err(RelayError::StreamClosed(stream))
        );
        assert!(reg.store().stream_info(stream).is_none());
        assert!(!reg.has_session(session).await);
        assert_eq!(
            reg.create_stream(session, request(2)).await,
            Err(RelayError::SessionTornDown(session))
        );
    }

    #[tokio::test]
    async fn sweep_closes_long_detached_notification_streams() {
        let reg = registry();
        let session = reg.create_session().await;
        let attachment = reg.open_notification_stream(session).await.unwrap();
        let stream = attachment.stream();
        drop(attachment);

        let now = Instant::now();
        let report = reg.sweep_idle(now).await;
        assert_eq!(report.detached, 1);
        assert_eq!(report.closed_streams, 0);

        let later = now + Duration::from_secs(reg.config().persistent_idle_timeout_secs + 1);
        let report = reg.sweep_idle(later).await;
        assert_eq!(report.closed_streams, 1);
        assert!(reg.stream_state(stream).await.is_none());
        assert!(reg.has_session(session).await);
    }

    #[tokio::test]
    async fn sweep_leaves_transportless_request_streams_open() {
        let reg = registry();
        let session = reg.create_session().await;
        let stream = reg.create_stream(session, request(1)).await.unwrap();
        reg.route(stream, note(1)).await.unwrap();

        let report = reg.sweep_idle(Instant::now()).await;
        assert_eq!(report.detached, 0);
        assert_eq!(reg.stream_state(stream).await, Some(StreamState::Open));
    }

    #[tokio::test]
    async fn sweep_tears_down_idle_sessions_only() {
        let reg = registry();
        let idle = reg.create_session().await;
        let busy = reg.create_session().await;
        let _running = reg.create_stream(busy, request(1)).await.unwrap();
        let listening = reg.create_session().await;
        let _live = reg.open_notification_stream(listening).await.unwrap();

        let later = Instant::now() + Duration::from_secs(reg.config().session_idle_timeout_secs + 1);
        let report = reg.sweep_idle(later).await;

        assert_eq!(report.torn_down_sessions, 1);
        assert!(!reg.has_session(idle).await);
        assert!(reg.has_session(busy).await);
        assert!(reg.has_session(listening).await);
    }
}
