//! Method registry and per-request dispatch.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rpc_stream_core::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, SessionId, StreamKind,
    jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, REQUEST_TIMEOUT},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::{
    SessionRegistry,
    error::RelayError,
    notifier::Notifier,
    stream::{Attachment, StreamEntry},
};

/// Failure reported by a handler; becomes the JSON-RPC error of the response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({code})")]
pub struct HandlerError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

impl From<HandlerError> for JsonRpcError {
    fn from(err: HandlerError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Trait implemented by every RPC method handler.
///
/// Handlers may call [`Notifier::notify`] any number of times before
/// returning; the returned value (or error) becomes the terminal response.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params.
    async fn execute(&self, params: Option<Value>, notifier: Notifier)
    -> Result<Value, HandlerError>;
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    #[must_use]
    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    /// Check whether a method is registered.
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// List all registered method names (sorted).
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs each request on its own stream and task.
///
/// Handlers are never cancelled because a client went away: they run to
/// completion and whatever they emit stays buffered for replay.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    methods: Arc<MethodRegistry>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, methods: Arc<MethodRegistry>) -> Self {
        Self { registry, methods }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    /// Run `request` and wait for its response.
    ///
    /// Notifications are still recorded on the request's stream but nothing
    /// is delivered live.
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] if the session does not exist.
    #[instrument(skip(self, request), fields(method = %request.method, id = %request.id))]
    pub async fn dispatch(
        &self,
        session: SessionId,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, RelayError> {
        let id = request.id.clone();
        let entry = self.open(session, &request).await?;
        let task = self.spawn(entry, request);
        Ok(task.await.unwrap_or_else(|e| {
            warn!("request task failed: {e}");
            JsonRpcResponse::failure(id, JsonRpcError::new(INTERNAL_ERROR, "request task failed"))
        }))
    }

    /// Run `request` with its stream attached to a live transport.
    ///
    /// The attachment yields every notification followed by the response,
    /// then ends.
    ///
    /// # Errors
    /// Returns [`RelayError::SessionTornDown`] if the session does not exist.
    #[instrument(skip(self, request), fields(method = %request.method, id = %request.id))]
    pub async fn dispatch_streaming(
        &self,
        session: SessionId,
        request: JsonRpcRequest,
    ) -> Result<Attachment, RelayError> {
        let entry = self.open(session, &request).await?;
        let (transport_id, rx) = entry.inner.lock().await.attach();
        let attachment = Attachment::new(entry.id, entry.kind.clone(), transport_id, rx);
        drop(self.spawn(entry, request));
        Ok(attachment)
    }

    async fn open(
        &self,
        session: SessionId,
        request: &JsonRpcRequest,
    ) -> Result<Arc<StreamEntry>, RelayError> {
        let kind = StreamKind::Request {
            request_id: request.id.clone(),
        };
        self.registry.open_stream(session, kind).await
    }

    fn spawn(
        &self,
        entry: Arc<StreamEntry>,
        request: JsonRpcRequest,
    ) -> tokio::task::JoinHandle<JsonRpcResponse> {
        let registry = Arc::clone(&self.registry);
        let methods = Arc::clone(&self.methods);
        tokio::spawn(async move {
            let notifier = Notifier::new(Arc::clone(&registry), Arc::clone(&entry));
            let response = run_handler(&registry, &methods, request, notifier).await;
            if let Err(e) = registry.complete(&entry, response.clone()).await {
                warn!(stream = %entry.id, "response not recorded: {e}");
            }
            response
        })
    }
}

async fn run_handler(
    registry: &SessionRegistry,
    methods: &MethodRegistry,
    request: JsonRpcRequest,
    notifier: Notifier,
) -> JsonRpcResponse {
    let JsonRpcRequest {
        id, method, params, ..
    } = request;

    let Some(handler) = methods.get(&method) else {
        return method_not_found(id, &method);
    };

    // Own task so a panicking handler still yields a response.
    let mut task = tokio::spawn(async move { handler.execute(params, notifier).await });
    let joined = match registry.config().handler_timeout() {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                task.abort();
                tracing::error!(method = %method, "handler timed out after {limit:?}");
                return JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(REQUEST_TIMEOUT, format!("Handler for '{method}' timed out")),
                );
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(result)) => JsonRpcResponse::success(id, result),
        Ok(Err(err)) => {
            tracing::debug!(method = %method, code = err.code, "handler failed: {}", err.message);
            JsonRpcResponse::failure(id, err.into())
        }
        Err(join_err) => {
            tracing::error!(method = %method, "handler aborted: {join_err}");
            JsonRpcResponse::failure(id, internal_error(&join_err))
        }
    }
}

fn internal_error(join_err: &tokio::task::JoinError) -> JsonRpcError {
    let message = if join_err.is_panic() {
        "handler panicked"
    } else {
        "handler was cancelled"
    };
    JsonRpcError::new(INTERNAL_ERROR, message)
}

fn method_not_found(id: RequestId, method: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(
        id,
        JsonRpcError::new(METHOD_NOT_FOUND, format!("Method '{method}' not found")),
    )
}
