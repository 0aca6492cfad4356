//! Shared primitive types and time helpers.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 1 MiB in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Idle gap after which the next event opens a new session.
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Hard upper bound on a session's lifetime.
pub const SESSION_MAX_DURATION_MS: u64 = 12 * 60 * 60 * 1000;

/// Number of oldest records removed by one low-memory sweep.
pub const EVICTION_SWEEP_SIZE: usize = 100;

/// Property key carrying the session identifier.
pub const EVENT_SESSION_ID: &str = "$event_session_id";

/// Library name reported in `$lib`.
pub const LIB_NAME: &str = "Rust";

/// Library version reported in `$lib_version`.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kind of record emitted by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Track,
    TrackIdBind,
    TrackIdUnbind,
    Default,
}

impl EventType {
    /// Wire tag written into the payload's `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Track => "track",
            EventType::TrackIdBind => "track_id_bind",
            EventType::TrackIdUnbind => "track_id_unbind",
            EventType::Default => "default",
        }
    }

    /// Track-family events carry an event name and take part in sessions.
    pub fn is_track(&self) -> bool {
        matches!(
            self,
            EventType::Track | EventType::TrackIdBind | EventType::TrackIdUnbind
        )
    }
}

/// Verbosity mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    #[default]
    Off,
    DebugOnly,
    DebugAndTrack,
}

impl DebugMode {
    pub fn is_debug(&self) -> bool {
        !matches!(self, DebugMode::Off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        assert_eq!(EventType::Track.as_str(), "track");
        assert_eq!(EventType::TrackIdBind.as_str(), "track_id_bind");
        assert!(EventType::TrackIdUnbind.is_track());
        assert!(!EventType::Default.is_track());
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_ms() > 1_577_836_800_000);
    }
}
