//! # Agent Configuration
//!
//! All tunables of the tracking agent. Setters clamp out-of-range values the
//! same way [`AgentConfig::normalized`] does for values loaded from JSON or
//! the environment, so a config never carries a cap below its floor.

use crate::error::{AgentError, Result};
use crate::types::{DebugMode, MIB};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default on-disk cap for pending events.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 32 * MIB;
/// Configured caps below this are raised to it.
pub const MIN_MAX_CACHE_SIZE: u64 = 16 * MIB;

pub const DEFAULT_FLUSH_BULK_SIZE: usize = 100;
pub const MIN_FLUSH_BULK_SIZE: usize = 50;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 15;
pub const MIN_FLUSH_INTERVAL_SECS: u64 = 5;

pub const DEFAULT_MIN_REQUEST_INTERVAL_HOURS: u32 = 24;
pub const DEFAULT_MAX_REQUEST_INTERVAL_HOURS: u32 = 48;
/// Upper bound for both remote-config request interval bounds (7 days).
pub const MAX_REQUEST_INTERVAL_HOURS: u32 = 7 * 24;

pub const DEFAULT_REPLAY_CAPACITY: usize = 10_000;

/// Tracking agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// SQLite database holding pending events and persisted agent state
    pub db_path: PathBuf,

    /// Collection endpoint for event batches
    pub server_url: Option<String>,

    /// Endpoint serving the remote policy document
    pub remote_config_url: Option<String>,

    /// Cap on the store's byte footprint (floor 16 MiB)
    pub max_cache_size: u64,

    /// Records per flushed batch, also the pending count that triggers a flush
    pub flush_bulk_size: usize,

    /// Periodic flush every N seconds
    pub flush_interval_secs: u64,

    /// Lower bound of the remote config request interval, hours
    pub min_request_interval_hours: u32,

    /// Upper bound of the remote config request interval, hours
    pub max_request_interval_hours: u32,

    /// Stamp `$event_session_id` on track events
    pub enable_session: bool,

    /// Initial consent state
    pub collection_enabled: bool,

    /// Maximum tasks held while consent is withheld
    pub replay_capacity: usize,

    /// Session heartbeat every N seconds
    pub heartbeat_interval_secs: u64,

    /// Network timeout applied by the bundled HTTP transport
    pub transport_timeout_secs: u64,

    pub debug_mode: DebugMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            db_path: PathBuf::from("./var/data/tracker_events.db"),
            server_url: None,
            remote_config_url: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            flush_bulk_size: DEFAULT_FLUSH_BULK_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            min_request_interval_hours: DEFAULT_MIN_REQUEST_INTERVAL_HOURS,
            max_request_interval_hours: DEFAULT_MAX_REQUEST_INTERVAL_HOURS,
            enable_session: true,
            collection_enabled: true,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            heartbeat_interval_secs: 30,
            transport_timeout_secs: 30,
            debug_mode: DebugMode::Off,
        }
    }
}

impl AgentConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)
            .map_err(|e| AgentError::Serialization(format!("Failed to parse agent config: {}", e)))?;
        Ok(config.normalized())
    }

    /// Defaults overridden by `TRACKER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = AgentConfig::default();

        if let Ok(path) = std::env::var("TRACKER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("TRACKER_SERVER_URL") {
            config.server_url = Some(url);
        }
        if let Ok(url) = std::env::var("TRACKER_REMOTE_CONFIG_URL") {
            config.remote_config_url = Some(url);
        }
        if let Some(size) = env_parse::<u64>("TRACKER_MAX_CACHE_SIZE") {
            config.max_cache_size = size;
        }
        if let Some(bulk) = env_parse::<usize>("TRACKER_FLUSH_BULK_SIZE") {
            config.flush_bulk_size = bulk;
        }

        config.normalized()
    }

    /// Re-apply every clamp.
    pub fn normalized(self) -> Self {
        let (cache, bulk, secs) = (
            self.max_cache_size,
            self.flush_bulk_size,
            self.flush_interval_secs,
        );
        let (min, max) = (
            self.min_request_interval_hours,
            self.max_request_interval_hours,
        );
        self.with_max_cache_size(cache)
            .with_flush_bulk_size(bulk)
            .with_flush_interval_secs(secs)
            .with_request_intervals(min, max)
    }

    /// Cap the store footprint. Values below 16 MiB are raised to 16 MiB.
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes.max(MIN_MAX_CACHE_SIZE);
        self
    }

    /// Batch size, never below 50.
    pub fn with_flush_bulk_size(mut self, size: usize) -> Self {
        self.flush_bulk_size = size.max(MIN_FLUSH_BULK_SIZE);
        self
    }

    pub fn with_flush_interval_secs(mut self, secs: u64) -> Self {
        self.flush_interval_secs = secs.max(MIN_FLUSH_INTERVAL_SECS);
        self
    }

    /// Remote config request interval bounds, each clamped to `(0, 168]`
    /// hours. A zero bound falls back to its default; inverted bounds are
    /// swapped.
    pub fn with_request_intervals(mut self, min_hours: u32, max_hours: u32) -> Self {
        let min = clamp_interval(min_hours, DEFAULT_MIN_REQUEST_INTERVAL_HOURS);
        let max = clamp_interval(max_hours, DEFAULT_MAX_REQUEST_INTERVAL_HOURS);
        self.min_request_interval_hours = min.min(max);
        self.max_request_interval_hours = min.max(max);
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn with_remote_config_url(mut self, url: impl Into<String>) -> Self {
        self.remote_config_url = Some(url.into());
        self
    }

    pub fn with_session(mut self, enabled: bool) -> Self {
        self.enable_session = enabled;
        self
    }

    /// Start with collection consent withheld.
    pub fn disable_data_collect(mut self) -> Self {
        self.collection_enabled = false;
        self
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity.max(1);
        self
    }

    pub fn with_debug_mode(mut self, mode: DebugMode) -> Self {
        self.debug_mode = mode;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs.max(1))
    }
}

fn clamp_interval(hours: u32, default: u32) -> u32 {
    if hours == 0 {
        default
    } else {
        hours.min(MAX_REQUEST_INTERVAL_HOURS)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
