//! # Remote Config Gate
//!
//! Applies server-side collection switches: the kill switch, the event
//! blacklist and the debug-mode override.
//!
//! Fetched documents are cached raw in the state store. A document with
//! `effect_mode == 1` is applied as soon as it arrives; any other document
//! takes effect on the next start, when the gate loads the cache.

use super::config::RemoteConfig;
use super::schedule::{FetchSchedule, FetchScheduleMode};
use super::source::ConfigSource;
use crate::error::Result;
use crate::storage::StateStore;
use crate::types::DebugMode;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

pub const REMOTE_CONFIG_KEY: &str = "remote.config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Server reported the cached version as current
    NotModified,
    /// New document cached; `applied` tells whether it is live already
    Updated { config: RemoteConfig, applied: bool },
}

pub struct RemoteConfigGate {
    active: RwLock<RemoteConfig>,
    debug_mode: RwLock<DebugMode>,
    store: Arc<dyn StateStore>,
    schedule: FetchSchedule,
}

impl std::fmt::Debug for RemoteConfigGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfigGate")
            .field("active", &*self.active.read())
            .field("debug_mode", &*self.debug_mode.read())
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl RemoteConfigGate {
    /// Build the gate and apply whatever config was cached last run.
    pub fn new(store: Arc<dyn StateStore>, schedule: FetchSchedule, debug_mode: DebugMode) -> Self {
        let gate = Self {
            active: RwLock::new(RemoteConfig::default()),
            debug_mode: RwLock::new(debug_mode),
            store,
            schedule,
        };
        gate.apply_from_cache();
        gate
    }

    pub fn current(&self) -> RemoteConfig {
        self.active.read().clone()
    }

    pub fn is_sdk_disabled(&self) -> bool {
        self.active.read().disable_sdk
    }

    pub fn ignore_event(&self, event_name: &str) -> bool {
        self.active.read().ignores(event_name)
    }

    pub fn debug_mode(&self) -> DebugMode {
        *self.debug_mode.read()
    }

    /// Host-requested debug mode. Ignored while the remote config forbids it.
    pub fn set_debug_mode(&self, mode: DebugMode) {
        if mode.is_debug() && self.active.read().disable_debug_mode {
            warn!("Debug mode disabled by remote config");
            return;
        }
        *self.debug_mode.write() = mode;
    }

    /// Replace the active config wholesale.
    pub fn apply(&self, config: RemoteConfig) {
        if config.disable_debug_mode {
            *self.debug_mode.write() = DebugMode::Off;
        }
        if config.disable_sdk {
            info!("Remote config disabled collection");
        }
        info!(
            "Remote config applied (version {:?}, {} blacklisted events)",
            config.version,
            config.event_blacklist.len()
        );
        *self.active.write() = config;
    }

    /// Apply the cached document, or the permissive default when none.
    pub fn apply_from_cache(&self) {
        self.apply(self.cached().unwrap_or_default());
    }

    /// Last fetched config, whether or not it is live.
    pub fn cached(&self) -> Option<RemoteConfig> {
        match self.store.get_string(REMOTE_CONFIG_KEY) {
            Ok(Some(document)) => Some(RemoteConfig::parse_or_default(&document)),
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read cached remote config: {}", e);
                None
            }
        }
    }

    /// Cache a fetched document and apply it when it asks to take effect
    /// immediately. Returns the parsed config and whether it was applied.
    pub fn on_fetched(&self, document: &str) -> (RemoteConfig, bool) {
        if let Err(e) = self.store.set_string(REMOTE_CONFIG_KEY, document) {
            error!("Failed to cache remote config: {}", e);
        }

        let config = RemoteConfig::parse_or_default(document);
        if config.effect_immediately {
            self.apply(config.clone());
            (config, true)
        } else {
            debug!("remote config cached, takes effect on next start");
            (config, false)
        }
    }

    /// One fetch round against `source`. On failure the config and anchor
    /// are left unchanged.
    pub fn fetch_once(&self, source: &dyn ConfigSource, now: u64) -> Result<FetchOutcome> {
        let current_version = self.cached().and_then(|config| config.version);
        let fetched = source.fetch(current_version.as_deref())?;
        self.schedule.apply(FetchScheduleMode::Write, now);

        match fetched {
            None => Ok(FetchOutcome::NotModified),
            Some(document) => {
                let (config, applied) = self.on_fetched(&document);
                Ok(FetchOutcome::Updated { config, applied })
            }
        }
    }

    pub fn schedule_fetch(&self, mode: FetchScheduleMode, now: u64) {
        self.schedule.apply(mode, now);
    }

    pub fn is_fetch_due(&self, now: u64) -> bool {
        self.schedule.is_fetch_due(now)
    }

    pub fn next_fetch_at(&self) -> Option<u64> {
        self.schedule.next_fetch_at()
    }
}
