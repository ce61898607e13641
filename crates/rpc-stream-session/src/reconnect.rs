//! Resumption of a stream from a client's `Last-Event-ID`.

use std::sync::Arc;

use rpc_stream_core::{Event, EventId, SessionId, StreamKind, StreamState};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{SessionRegistry, error::RelayError, stream::Attachment};

/// Replays missed events and re-attaches live delivery.
#[derive(Clone)]
pub struct Reconnector {
    registry: Arc<SessionRegistry>,
}

impl Reconnector {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Resume the stream `last_event_id` belongs to.
    ///
    /// The returned attachment first yields every event after
    /// `last_event_id`. If the stream is still open it stays attached for
    /// live delivery; if it already recorded its response the attachment
    /// ends right after the replay.
    ///
    /// # Errors
    /// - [`RelayError::SessionTornDown`] if `session` does not exist.
    /// - [`RelayError::Forbidden`] if the stream belongs to another session.
    /// - [`RelayError::Unresumable`] if the events after `last_event_id` are gone.
    pub async fn reconnect(
        &self,
        session: SessionId,
        last_event_id: EventId,
    ) -> Result<Attachment, RelayError> {
        self.registry.touch_session(session).await?;

        if let Some(attachment) = self.resume_live(session, last_event_id).await? {
            return Ok(attachment);
        }
        self.replay_closed(session, last_event_id)
    }

    /// Re-attach to a stream that is still registered. `None` if it has
    /// closed in the meantime.
    async fn resume_live(
        &self,
        session: SessionId,
        last_event_id: EventId,
    ) -> Result<Option<Attachment>, RelayError> {
        let Some(entry) = self.registry.stream_entry(last_event_id.stream).await else {
            return Ok(None);
        };
        if entry.session.id != session {
            return Err(RelayError::Forbidden {
                event_id: last_event_id,
            });
        }

        // Holding the stream lock keeps routes out until replay and attach
        // are done, so nothing is skipped or sent twice.
        let mut inner = entry.inner.lock().await;
        if inner.state == StreamState::Closed {
            return Ok(None);
        }
        let events = self.replay(last_event_id, Some(&entry.kind))?;
        let (transport_id, rx) = inner.attach();
        let replayed = events.len();
        if let Some(slot) = &inner.transport {
            for event in events {
                if slot.tx.send(event).is_err() {
                    break;
                }
            }
        }
        drop(inner);

        info!(
            session = %session,
            stream = %entry.id,
            after = last_event_id.sequence,
            replayed,
            "stream resumed"
        );
        Ok(Some(Attachment::new(
            entry.id,
            entry.kind.clone(),
            transport_id,
            rx,
        )))
    }

    /// Replay a stream that already recorded its response, then end.
    fn replay_closed(
        &self,
        session: SessionId,
        last_event_id: EventId,
    ) -> Result<Attachment, RelayError> {
        let store = self.registry.store();
        let unresumable = |kind: Option<StreamKind>| RelayError::Unresumable {
            event_id: last_event_id,
            kind,
        };

        let Some(info) = store.stream_info(last_event_id.stream) else {
            // Events are gone; owner and kind may still be on record.
            return Err(match store.retired(last_event_id.stream) {
                Some(retired) if retired.session != session => RelayError::Forbidden {
                    event_id: last_event_id,
                },
                Some(retired) => unresumable(Some(retired.kind)),
                None => unresumable(None),
            });
        };
        if info.session != session {
            return Err(RelayError::Forbidden {
                event_id: last_event_id,
            });
        }
        if !info.sealed {
            return Err(unresumable(Some(info.kind)));
        }

        let events = self.replay(last_event_id, Some(&info.kind))?;
        debug!(
            stream = %last_event_id.stream,
            replayed = events.len(),
            "replaying closed stream"
        );

        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        for event in events {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(event);
        }
        drop(tx);
        Ok(Attachment::new(
            last_event_id.stream,
            info.kind,
            Uuid::new_v4(),
            rx,
        ))
    }

    fn replay(
        &self,
        last_event_id: EventId,
        kind: Option<&StreamKind>,
    ) -> Result<Vec<Event>, RelayError> {
        self.registry
            .store()
            .replay(last_event_id)
            .map_err(|_| RelayError::Unresumable {
                event_id: last_event_id,
                kind: kind.cloned(),
            })
    }
}
