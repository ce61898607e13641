//! Identifiers for sessions, streams and events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session identifier, issued by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdParseError::Session(s.to_owned()))
    }
}

/// Stream identifier.
///
/// Rendered in the compact 32-hex form so it never contains the `_` separator
/// used by [`EventId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh random stream id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.simple().fmt(f)
    }
}

impl FromStr for StreamId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| IdParseError::Stream(s.to_owned()))
    }
}

/// Globally unique event id: `(stream, sequence)`.
///
/// On the wire this is the opaque string `<stream>_<sequence>`, which clients
/// echo back verbatim as `Last-Event-ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    /// Owning stream.
    pub stream: StreamId,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
}

impl EventId {
    #[must_use]
    pub const fn new(stream: StreamId, sequence: u64) -> Self {
        Self { stream, sequence }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.stream, self.sequence)
    }
}

impl FromStr for EventId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdParseError::Event(s.to_owned());
        let (stream, sequence) = s.trim().rsplit_once('_').ok_or_else(invalid)?;
        let stream = stream.parse::<StreamId>().map_err(|_| invalid())?;
        let sequence = sequence.parse::<u64>().map_err(|_| invalid())?;
        if sequence == 0 {
            return Err(invalid());
        }
        Ok(Self { stream, sequence })
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Failure to parse an identifier received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("invalid session id: {0}")]
    Session(String),
    #[error("invalid stream id: {0}")]
    Stream(String),
    #[error("invalid event id: {0}")]
    Event(String),
}
