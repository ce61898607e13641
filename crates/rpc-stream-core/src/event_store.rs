//! Per-stream event log with bounded history for resumption.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use crate::{
    RelayConfig,
    error::StoreError,
    ids::{EventId, SessionId, StreamId},
    jsonrpc::JsonRpcMessage,
    stream::StreamKind,
};

/// One recorded message. Never mutated once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub message: JsonRpcMessage,
    pub created_at: SystemTime,
}

impl Event {
    /// Whether this event is a request stream's terminal response.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.message.is_response()
    }

    /// Frame as an SSE `message` event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let data = serde_json::to_string(&self.message).unwrap_or_else(|e| {
            tracing::error!(event_id = %self.id, "Failed to serialize event: {e}");
            "null".to_owned()
        });
        axum::response::sse::Event::default()
            .event("message")
            .id(self.id.to_string())
            .data(data)
    }
}

/// Ownership and position of a stream known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub session: SessionId,
    pub kind: StreamKind,
    pub sealed: bool,
    pub last_sequence: u64,
}

/// What remains known about a stream after its events were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredStream {
    pub session: SessionId,
    pub kind: StreamKind,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub tracked_streams: usize,
    pub buffered_events: usize,
    pub evicted_in_flight: usize,
}

struct StreamLog {
    session: SessionId,
    kind: StreamKind,
    events: VecDeque<Event>,
    last_sequence: u64,
    sealed: bool,
    /// Set when the entry leaves the map; holders of a stale `Arc` must retry.
    evicted: bool,
}

impl StreamLog {
    fn first_retained(&self) -> u64 {
        self.events
            .front()
            .map_or(self.last_sequence + 1, |e| e.id.sequence)
    }
}

struct Entry {
    log: Mutex<StreamLog>,
    last_active: AtomicU64,
}

impl Entry {
    fn lock(&self) -> MutexGuard<'_, StreamLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Numbering floor of an open stream whose log was evicted for capacity.
/// Appends that arrive later resume from here so ids never repeat.
struct Tombstone {
    session: SessionId,
    kind: StreamKind,
    last_sequence: u64,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamId, Arc<Entry>>,
    evicted: HashMap<StreamId, Tombstone>,
    /// Bounded, oldest first.
    retired: HashMap<StreamId, RetiredStream>,
    retired_order: VecDeque<StreamId>,
}

impl Inner {
    fn retire(&mut self, stream: StreamId, record: RetiredStream, cap: usize) {
        if self.retired.insert(stream, record).is_none() {
            self.retired_order.push_back(stream);
        }
        while self.retired_order.len() > cap {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

/// Event store with per-stream bounded history.
///
/// Each stream keeps its most recent `max_events_per_stream` events; at most
/// `max_tracked_streams` streams are tracked, evicting the least recently
/// active request stream in full when a new one needs room. Notification
/// streams are pinned and only leave through [`EventStore::forget`].
pub struct EventStore {
    inner: RwLock<Inner>,
    clock: AtomicU64,
    max_events_per_stream: usize,
    max_tracked_streams: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

impl EventStore {
    /// Create a store sized from `config`.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_limits(config.max_events_per_stream, config.max_tracked_streams)
    }

    /// Create a store with explicit limits (each at least 1).
    #[must_use]
    pub fn with_limits(max_events_per_stream: usize, max_tracked_streams: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock: AtomicU64::new(0),
            max_events_per_stream: max_events_per_stream.max(1),
            max_tracked_streams: max_tracked_streams.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Start tracking a stream. No-op if it is already tracked.
    pub fn open_stream(&self, stream: StreamId, session: SessionId, kind: StreamKind) {
        let mut inner = self.write();
        if inner.streams.contains_key(&stream) {
            return;
        }
        let log = StreamLog {
            session,
            kind,
            events: VecDeque::new(),
            last_sequence: 0,
            sealed: false,
            evicted: false,
        };
        self.insert_locked(&mut inner, stream, log);
    }

    fn insert_locked(&self, inner: &mut Inner, stream: StreamId, log: StreamLog) -> Arc<Entry> {
        while inner.streams.len() >= self.max_tracked_streams {
            if !Self::evict_one(inner, self.max_tracked_streams) {
                break;
            }
        }
        let entry = Arc::new(Entry {
            log: Mutex::new(log),
            last_active: AtomicU64::new(self.tick()),
        });
        inner.streams.insert(stream, Arc::clone(&entry));
        entry
    }

    /// Drop the least recently active request stream. Returns false when
    /// every tracked stream is pinned.
    fn evict_one(inner: &mut Inner, retain: usize) -> bool {
        let victim = inner
            .streams
            .iter()
            .filter(|(_, entry)| !entry.lock().kind.is_persistent())
            .min_by_key(|(_, entry)| entry.last_active.load(Ordering::Relaxed))
            .map(|(id, _)| *id);

        let Some(victim) = victim else {
            return false;
        };
        let Some(entry) = inner.streams.remove(&victim) else {
            return false;
        };

        let mut log = entry.lock();
        log.evicted = true;
        tracing::debug!(
            stream = %victim,
            events = log.events.len(),
            sealed = log.sealed,
            "evicting stream from event store"
        );
        if log.sealed {
            let record = RetiredStream {
                session: log.session,
                kind: log.kind.clone(),
            };
            drop(log);
            inner.retire(victim, record, retain);
        } else {
            inner.evicted.insert(
                victim,
                Tombstone {
                    session: log.session,
                    kind: log.kind.clone(),
                    last_sequence: log.last_sequence,
                },
            );
        }
        true
    }

    fn entry(&self, stream: StreamId) -> Option<Arc<Entry>> {
        self.read().streams.get(&stream).cloned()
    }

    /// Entry for an append, recreating the log of an evicted open stream.
    fn entry_for_append(&self, stream: StreamId) -> Result<Arc<Entry>, StoreError> {
        if let Some(entry) = self.entry(stream) {
            return Ok(entry);
        }

        let mut inner = self.write();
        if let Some(entry) = inner.streams.get(&stream) {
            return Ok(Arc::clone(entry));
        }
        let Some(tomb) = inner.evicted.remove(&stream) else {
            return Err(StoreError::StreamClosed(stream));
        };
        let log = StreamLog {
            session: tomb.session,
            kind: tomb.kind,
            events: VecDeque::new(),
            last_sequence: tomb.last_sequence,
            sealed: false,
            evicted: false,
        };
        Ok(self.insert_locked(&mut inner, stream, log))
    }

    /// Record `message` as the next event on `stream`.
    ///
    /// Capacity eviction never fails an append; it only shortens what
    /// [`EventStore::replay`] can return later.
    ///
    /// # Errors
    /// Returns [`StoreError::StreamClosed`] if the stream is sealed or was forgotten.
    pub fn append(&self, stream: StreamId, message: JsonRpcMessage) -> Result<EventId, StoreError> {
        self.append_event(stream, message).map(|event| event.id)
    }

    /// Like [`EventStore::append`], returning a copy of the recorded event.
    ///
    /// # Errors
    /// Returns [`StoreError::StreamClosed`] if the stream is sealed or was forgotten.
    pub fn append_event(
        &self,
        stream: StreamId,
        message: JsonRpcMessage,
    ) -> Result<Event, StoreError> {
        loop {
            let entry = self.entry_for_append(stream)?;
            let mut log = entry.lock();
            if log.evicted {
                // Lost a race with eviction; the tombstone now holds the floor.
                continue;
            }
            if log.sealed {
                return Err(StoreError::StreamClosed(stream));
            }

            log.last_sequence += 1;
            let event = Event {
                id: EventId::new(stream, log.last_sequence),
                message,
                created_at: SystemTime::now(),
            };
            log.events.push_back(event.clone());
            while log.events.len() > self.max_events_per_stream {
                log.events.pop_front();
            }
            entry.last_active.store(self.tick(), Ordering::Relaxed);
            return Ok(event);
        }
    }

    /// Events of `after.stream` with a sequence greater than `after.sequence`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the stream is unknown, the id is
    /// ahead of the stream, or events following it have been evicted.
    pub fn replay(&self, after: EventId) -> Result<Vec<Event>, StoreError> {
        let not_found = || StoreError::NotFound(after);
        let entry = self.entry(after.stream).ok_or_else(not_found)?;
        let log = entry.lock();
        if log.evicted || after.sequence > log.last_sequence {
            return Err(not_found());
        }
        // The resumption point itself must still be retained.
        if after.sequence < log.first_retained() {
            return Err(not_found());
        }
        entry.last_active.store(self.tick(), Ordering::Relaxed);
        Ok(log
            .events
            .iter()
            .filter(|e| e.id.sequence > after.sequence)
            .cloned()
            .collect())
    }

    /// Every retained event of `stream`, oldest first.
    #[must_use]
    pub fn history(&self, stream: StreamId) -> Vec<Event> {
        self.entry(stream)
            .map(|entry| entry.lock().events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Refuse further appends to `stream`.
    pub fn seal(&self, stream: StreamId) {
        if let Some(entry) = self.entry(stream) {
            entry.lock().sealed = true;
        }
        self.write().evicted.remove(&stream);
    }

    /// Stop tracking `stream` and drop its events.
    ///
    /// Its owner and kind stay available through [`EventStore::retired`].
    pub fn forget(&self, stream: StreamId) {
        let mut inner = self.write();
        let tomb = inner.evicted.remove(&stream).map(|tomb| RetiredStream {
            session: tomb.session,
            kind: tomb.kind,
        });
        let record = inner.streams.remove(&stream).map(|entry| {
            let mut log = entry.lock();
            log.evicted = true;
            RetiredStream {
                session: log.session,
                kind: log.kind.clone(),
            }
        });
        if let Some(record) = record.or(tomb) {
            inner.retire(stream, record, self.max_tracked_streams);
        }
    }

    /// Drop every stream owned by `session`.
    pub fn forget_session(&self, session: SessionId) {
        let mut inner = self.write();
        inner.evicted.retain(|_, tomb| tomb.session != session);
        inner.retired.retain(|_, record| record.session != session);
        let Inner {
            retired,
            retired_order,
            ..
        } = &mut *inner;
        retired_order.retain(|id| retired.contains_key(id));
        inner.streams.retain(|_, entry| {
            let mut log = entry.lock();
            if log.session == session {
                log.evicted = true;
                false
            } else {
                true
            }
        });
    }

    /// Owner, kind and position of `stream`, if it is still known.
    #[must_use]
    pub fn stream_info(&self, stream: StreamId) -> Option<StreamInfo> {
        let inner = self.read();
        if let Some(entry) = inner.streams.get(&stream) {
            let log = entry.lock();
            return Some(StreamInfo {
                session: log.session,
                kind: log.kind.clone(),
                sealed: log.sealed,
                last_sequence: log.last_sequence,
            });
        }
        inner.evicted.get(&stream).map(|tomb| StreamInfo {
            session: tomb.session,
            kind: tomb.kind.clone(),
            sealed: false,
            last_sequence: tomb.last_sequence,
        })
    }

    /// Owner and kind of a stream whose events were dropped by
    /// [`EventStore::forget`] or by capacity eviction after it was sealed.
    #[must_use]
    pub fn retired(&self, stream: StreamId) -> Option<RetiredStream> {
        self.read().retired.get(&stream).cloned()
    }

    #[must_use]
    pub fn owner(&self, stream: StreamId) -> Option<SessionId> {
        self.stream_info(stream).map(|info| info.session)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        StoreStats {
            tracked_streams: inner.streams.len(),
            buffered_events: inner.streams.values().map(|e| e.lock().events.len()).sum(),
            evicted_in_flight: inner.evicted.len(),
        }
    }
}
