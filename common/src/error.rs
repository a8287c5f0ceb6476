use thiserror::Error;

use crate::clock::Millis;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("watchdog feed interval {feed_ms} ms must be shorter than the watchdog period {period_ms} ms")]
    WatchdogStarved { feed_ms: u32, period_ms: u32 },
    #[error("device name `{name}` exceeds {max} characters")]
    NameTooLong { name: String, max: usize },
    #[error("invalid value for {key}: `{value}`")]
    Override { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("crash-persistent store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("crash-persistent store encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Conditions that end in the fail-safe halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("network link down for {outage_ms} ms (limit {limit_ms} ms)")]
    LinkTimeout { outage_ms: Millis, limit_ms: Millis },
    #[error("broker session down for {outage_ms} ms (limit {limit_ms} ms)")]
    SessionTimeout { outage_ms: Millis, limit_ms: Millis },
}

impl Fatal {
    /// Short message sized for the status display.
    pub fn display_message(self) -> &'static str {
        match self {
            Self::LinkTimeout { .. } => "WIFI TIMED OUT",
            Self::SessionTimeout { .. } => "HA TIMED OUT",
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Self::LinkTimeout { .. } => "link_timeout",
            Self::SessionTimeout { .. } => "session_timeout",
        }
    }
}
