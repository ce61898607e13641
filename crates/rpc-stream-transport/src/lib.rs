//! HTTP transport for the stream relay.
//!
//! Provides:
//! - Content negotiation and body parsing (`protocol`)
//! - axum routes for `/rpc` with JSON and SSE delivery (`http`)
//! - HTTP mapping of relay errors (`error`)

pub mod error;
pub mod http;
pub mod protocol;

pub use error::ApiError;
pub use http::{AppState, SessionContext, create_router};
pub use protocol::{LAST_EVENT_ID_HEADER, ResponseMode, SESSION_ID_HEADER};
