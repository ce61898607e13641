//! `/rpc` routes driven through the axum router.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode, header},
};
use rpc_stream_core::{JsonRpcNotification, RelayConfig, SessionId};
use rpc_stream_session::{
    Dispatcher, HandlerError, MethodHandler, MethodRegistry, Notifier, SessionRegistry,
};
use rpc_stream_transport::{AppState, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER, create_router};
use serde_json::{Value, json};
use tokio_test::assert_ok;
use tower::ServiceExt;

/// Reports progress once, then echoes its params.
struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn execute(&self, params: Option<Value>, notifier: Notifier) -> Result<Value, HandlerError> {
        notifier.notify("progress", Some(json!({ "pct": 50 }))).await.ok();
        Ok(params.unwrap_or(Value::Null))
    }
}

async fn app() -> (Router, Arc<SessionRegistry>, SessionId) {
    let registry = Arc::new(SessionRegistry::new(RelayConfig::default()));
    let session = registry.create_session().await;
    let mut methods = MethodRegistry::new();
    methods.register("echo", Echo);
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::new(methods));
    (create_router(AppState::new(dispatcher)), registry, session)
}

fn post(session: SessionId, accept: &str, body: &str) -> Request<Body> {
    Request::post("/rpc")
        .header(SESSION_ID_HEADER, session.to_string())
        .header(header::ACCEPT, accept)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

fn get(session: SessionId, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::get("/rpc")
        .header(SESSION_ID_HEADER, session.to_string())
        .header(header::ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        builder = builder.header(LAST_EVENT_ID_HEADER, id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    serde_json::from_str(&text(response).await).unwrap()
}

/// `id:` values of an SSE body, in order.
fn sse_ids(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .map(|id| id.trim().to_owned())
        .collect()
}

const ECHO: &str = r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"x":1}}"#;

#[tokio::test]
async fn json_mode_returns_the_response() {
    let (app, _, session) = app().await;
    let response = assert_ok!(app.oneshot(post(session, "application/json", ECHO)).await);

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"], json!({ "x": 1 }));
}

#[tokio::test]
async fn sse_mode_streams_progress_then_response() {
    let (app, _, session) = app().await;
    let response = app
        .oneshot(post(session, "application/json, text/event-stream", ECHO))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let body = text(response).await;
    let ids = sse_ids(&body);
    assert_eq!(ids.len(), 2);
    assert!(ids[0].ends_with("_1"));
    assert!(ids[1].ends_with("_2"));
    assert!(body.contains("event: message"));
    assert!(body.contains(r#""result":{"x":1}"#));
}

#[tokio::test]
async fn reconnect_replays_the_rest_of_a_finished_request() {
    let (app, _, session) = app().await;
    let first = app
        .clone()
        .oneshot(post(session, "text/event-stream", ECHO))
        .await
        .unwrap();
    let ids = sse_ids(&text(first).await);

    let resumed = app
        .oneshot(get(session, Some(&ids[0])))
        .await
        .unwrap();
    assert_eq!(resumed.status(), StatusCode::OK);
    let body = text(resumed).await;
    assert_eq!(sse_ids(&body), [ids[1].clone()]);
    assert!(body.contains(r#""result""#));
}

#[tokio::test]
async fn session_header_is_required_and_checked() {
    let (app, _, _) = app().await;
    let missing = Request::post("/rpc")
        .header(header::ACCEPT, "application/json")
        .body(Body::from(ECHO))
        .unwrap();
    let response = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post(SessionId::new(), "application/json", ECHO))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unacceptable_accept_header_is_406() {
    let (app, _, session) = app().await;
    let response = app.oneshot(post(session, "text/html", ECHO)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn malformed_bodies_get_jsonrpc_errors() {
    let (app, _, session) = app().await;

    let response = app
        .clone()
        .oneshot(post(session, "application/json", "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], -32700);

    let response = app
        .oneshot(post(session, "application/json", &format!("[{ECHO}]")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], -32600);
}

#[tokio::test]
async fn client_notifications_are_accepted() {
    let (app, _, session) = app().await;
    let response = app
        .oneshot(post(
            session,
            "application/json",
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn second_live_notification_stream_conflicts() {
    let (app, _, session) = app().await;
    let first = app.clone().oneshot(get(session, None)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get(session, None)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    drop(first);
}

#[tokio::test]
async fn foreign_event_ids_are_forbidden() {
    let (app, registry, owner) = app().await;
    let intruder = registry.create_session().await;
    let response = app
        .clone()
        .oneshot(post(owner, "text/event-stream", ECHO))
        .await
        .unwrap();
    let ids = sse_ids(&text(response).await);

    let response = assert_ok!(app.oneshot(get(intruder, Some(&ids[0]))).await);
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_event_id_is_unresumable() {
    let (app, _, session) = app().await;
    let unknown = format!("{}_3", uuid::Uuid::new_v4().simple());

    let response = app.clone().oneshot(get(session, Some(&unknown))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["event_id"], unknown);
    assert!(body["kind"].is_null());

    let response = app.oneshot(get(session, Some("garbage"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn idle_closed_notification_stream_is_unresumable_as_notification() {
    let (app, registry, session) = app().await;
    let live = assert_ok!(app.clone().oneshot(get(session, None)).await);
    assert_eq!(live.status(), StatusCode::OK);
    let id = registry
        .notify_session(session, JsonRpcNotification::new("tick", None))
        .await
        .unwrap()
        .unwrap();
    drop(live);

    let now = Instant::now();
    registry.sweep_idle(now).await;
    let later = now + Duration::from_secs(registry.config().persistent_idle_timeout_secs + 1);
    assert_eq!(registry.sweep_idle(later).await.closed_streams, 1);

    let response = assert_ok!(app.oneshot(get(session, Some(&id.to_string()))).await);
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "notification");
}

#[tokio::test]
async fn delete_ends_the_session() {
    let (app, registry, session) = app().await;
    let request = Request::delete("/rpc")
        .header(SESSION_ID_HEADER, session.to_string())
        .body(Body::empty())
        .unwrap();
    let response = assert_ok!(app.clone().oneshot(request).await);
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!registry.has_session(session).await);

    let response = app
        .oneshot(post(session, "application/json", ECHO))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
