//! Example relay server with a few streaming handlers.
//!
//! Run with: cargo run -p relay-server-demo
//!
//! Then create a session and call a method:
//! ```text
//! curl -X POST localhost:3000/session
//! curl -N -H 'x-session-id: <id>' -H 'accept: text/event-stream' \
//!      -d '{"jsonrpc":"2.0","id":1,"method":"progress","params":{"steps":5}}' localhost:3000/rpc
//! ```

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use rpc_stream_core::{JsonRpcNotification, RelayConfig};
use rpc_stream_session::{
    Dispatcher, HandlerError, MethodHandler, MethodRegistry, Notifier, SessionRegistry,
};
use rpc_stream_transport::{AppState, create_router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "RPC_STREAM_CONFIG";
const ADDR_ENV: &str = "RPC_STREAM_ADDR";
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Returns its params unchanged.
struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn execute(&self, params: Option<Value>, _notifier: Notifier) -> Result<Value, HandlerError> {
        Ok(params.unwrap_or(Value::Null))
    }
}

#[derive(Deserialize)]
struct ProgressParams {
    #[serde(default = "default_steps")]
    steps: u32,
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
}

const fn default_steps() -> u32 {
    3
}

const fn default_delay_ms() -> u64 {
    500
}

/// Reports `steps` progress notifications, pausing between each.
struct Progress;

#[async_trait]
impl MethodHandler for Progress {
    async fn execute(&self, params: Option<Value>, notifier: Notifier) -> Result<Value, HandlerError> {
        let params: ProgressParams = serde_json::from_value(params.unwrap_or_else(|| json!({})))?;
        for step in 1..=params.steps {
            tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
            // Stream closed by teardown: nobody can read further progress.
            if notifier
                .notify("progress", Some(json!({ "step": step, "of": params.steps })))
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(json!({ "completed": params.steps }))
    }
}

/// Always fails with the given message.
struct Fail;

#[async_trait]
impl MethodHandler for Fail {
    async fn execute(&self, params: Option<Value>, _notifier: Notifier) -> Result<Value, HandlerError> {
        let message = params
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        Err(HandlerError::internal(message))
    }
}

fn load_config() -> anyhow::Result<RelayConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => RelayConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {path}")),
        Err(_) => Ok(RelayConfig::default()),
    }
}

/// Stand-in for an external auth layer: issues a fresh session id.
async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let session = state.registry().create_session().await;
    (StatusCode::CREATED, Json(json!({ "session_id": session })))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let registry = state.registry();
    Json(json!({
        "sessions": registry.session_count().await,
        "store": registry.store().stats(),
    }))
}

/// Broadcast a tick to every open notification stream.
fn spawn_ticker(registry: Arc<SessionRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            let at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            let tick = JsonRpcNotification::new("server/tick", Some(json!({ "at": at })));
            let reached = registry.notify_all(&tick).await;
            tracing::debug!(reached, "tick broadcast");
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let registry = Arc::new(SessionRegistry::new(config));

    let mut methods = MethodRegistry::new();
    methods.register("echo", Echo);
    methods.register("progress", Progress);
    methods.register("fail", Fail);
    tracing::info!(methods = ?methods.methods(), "handlers registered");

    let state = AppState::new(Dispatcher::new(Arc::clone(&registry), Arc::new(methods)));
    let _sweeper = Arc::clone(&registry).spawn_sweeper();
    let _ticker = spawn_ticker(registry);

    // Build router
    let app = Router::new()
        .route("/session", post(create_session))
        .route("/stats", get(stats))
        .with_state(state.clone())
        .merge(create_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr: SocketAddr = std::env::var(ADDR_ENV)
        .unwrap_or_else(|_| "127.0.0.1:3000".to_owned())
        .parse()
        .with_context(|| format!("{ADDR_ENV} is not a socket address"))?;
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
