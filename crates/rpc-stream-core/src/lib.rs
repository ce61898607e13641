//! Core building blocks for streamed, resumable JSON-RPC delivery.
//!
//! This crate provides:
//! - `EventStore` - Per-stream bounded event log for replay after reconnect
//! - JSON-RPC envelope types
//! - Session, stream and event identifiers
//! - `RelayConfig` - Limits and timers shared by the other crates

pub mod config;
pub mod error;
pub mod event_store;
pub mod ids;
pub mod jsonrpc;
pub mod stream;

pub use config::{ConfigError, RelayConfig};
pub use error::StoreError;
pub use event_store::{Event, EventStore, RetiredStream, StoreStats, StreamInfo};
pub use ids::{EventId, IdParseError, SessionId, StreamId};
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use stream::{StreamKind, StreamState};
