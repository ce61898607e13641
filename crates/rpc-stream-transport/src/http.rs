//! Streamable HTTP transport: `POST`, `GET` and `DELETE` on `/rpc`.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::post,
};
use bytes::Bytes;
use futures::Stream;
use rpc_stream_core::{Event, EventId, JsonRpcMessage, SessionId, StreamId};
use rpc_stream_session::{Attachment, Dispatcher, Reconnector, SessionRegistry};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::{
    error::ApiError,
    protocol::{
        LAST_EVENT_ID_HEADER, ResponseMode, SESSION_ID_HEADER, accepts_event_stream, negotiate,
        parse_message,
    },
};

/// Shared state for the `/rpc` routes.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub reconnector: Reconnector,
}

impl AppState {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        let reconnector = Reconnector::new(Arc::clone(dispatcher.registry()));
        Self {
            dispatcher,
            reconnector,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }
}

/// Session resolved from the `x-session-id` header.
///
/// Rejects with 401 when the header is missing and 404 when the session is
/// unknown, so handlers only ever see live sessions.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext(pub SessionId);

impl FromRequestParts<AppState> for SessionContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let raw = parts
            .headers
            .get(SESSION_ID_HEADER)
            .ok_or(ApiError::MissingSession)?;
        let id: SessionId = raw
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ApiError::MalformedSession)?;
        if !state.registry().has_session(id).await {
            return Err(ApiError::UnknownSession(id));
        }
        Ok(Self(id))
    }
}

/// SSE body over an attachment that releases its transport when dropped.
struct EventStream {
    events: UnboundedReceiverStream<Event>,
    _guard: TransportGuard,
}

impl Stream for EventStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events)
            .poll_next(cx)
            .map(|event| event.map(|e| Ok(e.to_sse_event())))
    }
}

/// Detaches the transport from its stream once the client goes away.
struct TransportGuard {
    registry: Arc<SessionRegistry>,
    stream: StreamId,
    transport: Uuid,
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let (stream, transport) = (self.stream, self.transport);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { registry.detach_transport(stream, transport).await });
        }
    }
}

fn sse(state: &AppState, attachment: Attachment) -> Response {
    let guard = TransportGuard {
        registry: Arc::clone(state.registry()),
        stream: attachment.stream(),
        transport: attachment.transport_id(),
    };
    let events = EventStream {
        events: attachment.into_stream(),
        _guard: guard,
    };
    let keep_alive = KeepAlive::new().interval(state.registry().config().keep_alive());
    Sse::new(events).keep_alive(keep_alive).into_response()
}

/// `POST /rpc`: dispatch a request, acknowledge anything else.
async fn post_rpc(
    State(state): State<AppState>,
    SessionContext(session): SessionContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = match parse_message(&body).map_err(ApiError::Rpc)? {
        JsonRpcMessage::Request(request) => request,
        other => {
            tracing::debug!(session = %session, method = ?other.method(), "client message acknowledged");
            state.registry().touch_session(session).await?;
            return Ok(StatusCode::ACCEPTED.into_response());
        }
    };

    match negotiate(&headers).ok_or(ApiError::NotAcceptable)? {
        ResponseMode::EventStream => {
            let attachment = state
                .dispatcher
                .dispatch_streaming(session, request)
                .await?;
            Ok(sse(&state, attachment))
        }
        ResponseMode::Json => {
            let response = state.dispatcher.dispatch(session, request).await?;
            Ok(Json(response).into_response())
        }
    }
}

/// `GET /rpc`: open the notification stream, or resume from `Last-Event-ID`.
async fn get_rpc(
    State(state): State<AppState>,
    SessionContext(session): SessionContext,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }

    let attachment = match headers.get(LAST_EVENT_ID_HEADER) {
        Some(raw) => {
            let raw = raw.to_str().unwrap_or_default().trim();
            let last_event_id: EventId = raw
                .parse()
                .map_err(|_| ApiError::MalformedEventId(raw.to_owned()))?;
            state.reconnector.reconnect(session, last_event_id).await?
        }
        None => state.registry().open_notification_stream(session).await?,
    };
    Ok(sse(&state, attachment))
}

/// `DELETE /rpc`: end the session.
async fn delete_rpc(
    State(state): State<AppState>,
    SessionContext(session): SessionContext,
) -> Result<StatusCode, ApiError> {
    state.registry().teardown_session(session).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the `/rpc` router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_router(AppState::new(dispatcher)));
/// ```
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(post_rpc).get(get_rpc).delete(delete_rpc))
        .with_state(state)
}
