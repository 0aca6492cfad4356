//! Randomized fetch schedule.
//!
//! After each fetch the next one is anchored at `now + interval`, where the
//! interval is a whole number of hours drawn uniformly from
//! `[min_hours, max_hours]`. Spreading fetches this way keeps a fleet of
//! agents from hitting the config endpoint together.

use crate::storage::StateStore;
use log::{debug, error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const FETCH_ANCHOR_KEY: &str = "remote.request.anchor";

const HOUR_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScheduleMode {
    /// Commit a fresh randomized anchor
    Write,
    /// Remove the anchor so the next check fetches
    Clean,
    /// Leave the anchor alone
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAnchor {
    pub anchored_at: u64,
    pub interval_ms: u64,
}

impl FetchAnchor {
    pub fn due_at(&self) -> u64 {
        self.anchored_at.saturating_add(self.interval_ms)
    }
}

pub struct FetchSchedule {
    store: Arc<dyn StateStore>,
    min_hours: u32,
    max_hours: u32,
}

impl std::fmt::Debug for FetchSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSchedule")
            .field("min_hours", &self.min_hours)
            .field("max_hours", &self.max_hours)
            .finish()
    }
}

impl FetchSchedule {
    /// Bounds are expected to be normalized by `AgentConfig`; an inverted
    /// pair is swapped here as well.
    pub fn new(store: Arc<dyn StateStore>, min_hours: u32, max_hours: u32) -> Self {
        let (min_hours, max_hours) = if min_hours > max_hours {
            (max_hours, min_hours)
        } else {
            (min_hours, max_hours)
        };
        Self {
            store,
            min_hours,
            max_hours,
        }
    }

    pub fn bounds_hours(&self) -> (u32, u32) {
        (self.min_hours, self.max_hours)
    }

    pub fn apply(&self, mode: FetchScheduleMode, now: u64) {
        match mode {
            FetchScheduleMode::Write => {
                let jitter = rand::thread_rng().gen_range(0..=self.max_hours - self.min_hours);
                let anchor = FetchAnchor {
                    anchored_at: now,
                    interval_ms: u64::from(self.min_hours + jitter) * HOUR_MS,
                };
                debug!("next remote config fetch at {}", anchor.due_at());
                self.write_anchor(&anchor);
            }
            FetchScheduleMode::Clean => {
                if let Err(e) = self.store.remove(FETCH_ANCHOR_KEY) {
                    error!("Failed to clear fetch anchor: {}", e);
                }
            }
            FetchScheduleMode::None => {}
        }
    }

    pub fn anchor(&self) -> Option<FetchAnchor> {
        match self.store.get_string(FETCH_ANCHOR_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(anchor) => Some(anchor),
                Err(e) => {
                    warn!("Discarding unreadable fetch anchor: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read fetch anchor: {}", e);
                None
            }
        }
    }

    pub fn is_fetch_due(&self, now: u64) -> bool {
        match self.anchor() {
            Some(anchor) => now >= anchor.due_at(),
            None => true,
        }
    }

    pub fn next_fetch_at(&self) -> Option<u64> {
        self.anchor().map(|anchor| anchor.due_at())
    }

    fn write_anchor(&self, anchor: &FetchAnchor) {
        match serde_json::to_string(anchor) {
            Ok(json) => {
                if let Err(e) = self.store.set_string(FETCH_ANCHOR_KEY, &json) {
                    error!("Failed to persist fetch anchor: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize fetch anchor: {}", e),
        }
    }
}
