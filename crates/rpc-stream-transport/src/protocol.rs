//! Wire-level helpers: headers, content negotiation and body parsing.

use axum::http::{HeaderMap, header::ACCEPT};
use rpc_stream_core::{
    JsonRpcError, JsonRpcMessage,
    jsonrpc::{INVALID_REQUEST, PARSE_ERROR},
};
use serde_json::Value;

/// Header carrying the session identity.
pub const SESSION_ID_HEADER: &str = "x-session-id";
/// Header carrying the resumption point on `GET /rpc`.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub const EVENT_STREAM: &str = "text/event-stream";
pub const JSON: &str = "application/json";

/// How the outcome of a request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// A single `application/json` body with the response.
    Json,
    /// An SSE stream of notifications ending with the response.
    EventStream,
}

/// Media ranges listed in `Accept`, without parameters. Empty when absent.
fn accepted(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|range| range.split(';').next())
        .map(|range| range.trim().to_ascii_lowercase())
        .filter(|range| !range.is_empty())
        .collect()
}

/// Pick the response mode for a `POST /rpc`.
///
/// SSE wins whenever the client lists it. A missing `Accept` header means
/// JSON. `None` if the client accepts neither.
#[must_use]
pub fn negotiate(headers: &HeaderMap) -> Option<ResponseMode> {
    let ranges = accepted(headers);
    if ranges.is_empty() {
        return Some(ResponseMode::Json);
    }
    if ranges.iter().any(|r| r == EVENT_STREAM) {
        return Some(ResponseMode::EventStream);
    }
    ranges
        .iter()
        .any(|r| r == JSON || r == "application/*" || r == "*/*")
        .then_some(ResponseMode::Json)
}

/// Whether the client can take an SSE stream on `GET /rpc`.
#[must_use]
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let ranges = accepted(headers);
    ranges.is_empty()
        || ranges
            .iter()
            .any(|r| r == EVENT_STREAM || r == "text/*" || r == "*/*")
}

/// Decode one JSON-RPC message from a request body.
///
/// # Errors
/// Returns a parse error for malformed JSON and an invalid-request error for
/// batches or objects that are not JSON-RPC messages.
pub fn parse_message(body: &[u8]) -> Result<JsonRpcMessage, JsonRpcError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| JsonRpcError::new(PARSE_ERROR, format!("Parse error: {e}")))?;
    if value.is_array() {
        return Err(JsonRpcError::new(
            INVALID_REQUEST,
            "Batch requests are not supported",
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {e}")))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn event_stream_is_preferred() {
        assert_eq!(
            negotiate(&accept("application/json, text/event-stream")),
            Some(ResponseMode::EventStream)
        );
        assert_eq!(
            negotiate(&accept("text/event-stream;q=0.9")),
            Some(ResponseMode::EventStream)
        );
    }

    #[test]
    fn json_only_and_wildcards() {
        assert_eq!(negotiate(&accept("application/json")), Some(ResponseMode::Json));
        assert_eq!(negotiate(&accept("*/*")), Some(ResponseMode::Json));
        assert_eq!(negotiate(&HeaderMap::new()), Some(ResponseMode::Json));
    }

    #[test]
    fn unacceptable_types_are_rejected() {
        assert_eq!(negotiate(&accept("text/html")), None);
        assert!(!accepts_event_stream(&accept("application/json")));
        assert!(accepts_event_stream(&accept("text/event-stream")));
    }

    #[test]
    fn parse_classifies_bodies() {
        assert!(matches!(
            parse_message(br#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#),
            Ok(JsonRpcMessage::Request(_))
        ));
        assert!(matches!(
            parse_message(br#"{"jsonrpc":"2.0","method":"cancelled"}"#),
            Ok(JsonRpcMessage::Notification(_))
        ));
        assert_eq!(parse_message(b"{nope").unwrap_err().code, PARSE_ERROR);
        assert_eq!(parse_message(b"[]").unwrap_err().code, INVALID_REQUEST);
        assert_eq!(
            parse_message(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)
                .unwrap_err()
                .code,
            INVALID_REQUEST
        );
    }
}
