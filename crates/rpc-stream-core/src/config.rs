//! Relay configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Limits and timers for the stream relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Events retained per stream before the oldest are dropped.
    pub max_events_per_stream: usize,
    /// Streams tracked by the event store before whole streams are evicted.
    pub max_tracked_streams: usize,
    /// How long a detached notification stream survives before being closed.
    pub persistent_idle_timeout_secs: u64,
    /// How long a session with nothing attached and nothing running survives.
    pub session_idle_timeout_secs: u64,
    /// Interval between idle sweeps.
    pub sweep_interval_secs: u64,
    /// SSE keep-alive comment interval.
    pub keep_alive_secs: u64,
    /// Upper bound on a single handler's run time (unbounded when `None`).
    pub handler_timeout_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_events_per_stream: 500,
            max_tracked_streams: 100,
            persistent_idle_timeout_secs: 300,
            session_idle_timeout_secs: 1800,
            sweep_interval_secs: 30,
            keep_alive_secs: 15,
            handler_timeout_secs: None,
        }
    }
}

impl RelayConfig {
    /// Load from a JSON file; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the relay cannot operate with.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events_per_stream == 0 {
            return Err(ConfigError::Invalid(
                "max_events_per_stream must be at least 1".into(),
            ));
        }
        if self.max_tracked_streams == 0 {
            return Err(ConfigError::Invalid(
                "max_tracked_streams must be at least 1".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid(
                "keep_alive_secs must be at least 1".into(),
            ));
        }
        if self.handler_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "handler_timeout_secs must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn persistent_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.persistent_idle_timeout_secs)
    }

    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}
