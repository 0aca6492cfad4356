//! # Session Lifecycle Manager
//!
//! Time-driven session state machine. Every track event at time `t` either
//! continues the current session or opens a new one when
//! - no session exists,
//! - `t - last_event_at > 30 min` (idle timeout), or
//! - `t - started_at > 12 h` (hard cap).
//!
//! All bookkeeping uses the event-declared time. `last_event_at` never moves
//! backwards, so a late event cannot rewind the idle clock. The heartbeat
//! path may open a new session after an idle gap but never touches
//! `started_at`.
//!
//! State is persisted as JSON in the [`StateStore`] after every change.

use crate::codec::EventPayload;
use crate::storage::StateStore;
use crate::types::{EVENT_SESSION_ID, SESSION_IDLE_TIMEOUT_MS, SESSION_MAX_DURATION_MS};
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// State-store key holding the persisted session.
pub const SESSION_STATE_KEY: &str = "session.cutdata";

/// Persisted session bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(rename = "startTime")]
    pub started_at: u64,
    #[serde(rename = "lastEventTime")]
    pub last_event_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Active,
}

pub struct SessionLifecycleManager {
    state: Mutex<SessionState>,
    store: Arc<dyn StateStore>,
    enabled: bool,
}

impl std::fmt::Debug for SessionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("state", &*self.state.lock())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl SessionLifecycleManager {
    /// Load the persisted session, or wipe it when sessions are disabled.
    pub fn new(store: Arc<dyn StateStore>, enabled: bool) -> Self {
        let state = if enabled {
            load_state(store.as_ref())
        } else {
            if let Err(e) = store.remove(SESSION_STATE_KEY) {
                error!("Failed to delete session data: {}", e);
            }
            SessionState::default()
        };

        Self {
            state: Mutex::new(state),
            store,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> SessionPhase {
        if self.state.lock().session_id.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::NoSession
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Advance the state machine for an event at `event_time` and return the
    /// session id in effect. Returns `None` when disabled or for `t == 0`.
    pub fn stamp(&self, event_time: u64) -> Option<String> {
        if !self.enabled || event_time == 0 {
            return None;
        }

        let mut state = self.state.lock();
        let expired = match state.session_id {
            None => true,
            Some(_) => {
                event_time.saturating_sub(state.last_event_at) > SESSION_IDLE_TIMEOUT_MS
                    || event_time.saturating_sub(state.started_at) > SESSION_MAX_DURATION_MS
            }
        };

        if expired {
            let id = Uuid::new_v4().to_string();
            debug!("opening session {} at {}", id, event_time);
            state.session_id = Some(id);
            state.started_at = event_time;
        }
        state.last_event_at = state.last_event_at.max(event_time);

        self.persist(&state);
        state.session_id.clone()
    }

    /// Stamp `$event_session_id` onto a track payload.
    ///
    /// A payload that already carries a session id keeps it: the id was
    /// captured when the event logically happened. Its time still advances
    /// the state machine.
    pub fn stamp_payload(&self, payload: &mut EventPayload) {
        if !self.enabled || !payload.event_type.is_track() {
            return;
        }

        let current = self.stamp(payload.time);
        if payload.properties.contains_key(EVENT_SESSION_ID) {
            return;
        }
        if let Some(id) = current {
            payload
                .properties
                .insert(EVENT_SESSION_ID.to_string(), Value::String(id));
        }
    }

    /// Heartbeat path. Opens a new session when the idle timeout has passed
    /// since the last event; never changes `started_at` and does not count as
    /// activity otherwise. Without a session it does nothing; the first event
    /// opens one. Returns whether a new session was opened.
    pub fn refresh_by_timer(&self, now: u64) -> bool {
        if !self.enabled {
            return false;
        }

        let mut state = self.state.lock();
        if state.session_id.is_none() {
            return false;
        }
        if now.saturating_sub(state.last_event_at) <= SESSION_IDLE_TIMEOUT_MS {
            return false;
        }

        let id = Uuid::new_v4().to_string();
        debug!("heartbeat rotated session to {}", id);
        state.session_id = Some(id);
        state.last_event_at = state.last_event_at.max(now);
        self.persist(&state);
        true
    }

    fn persist(&self, state: &SessionState) {
        match serde_json::to_string(state) {
            Ok(json) => {
                if let Err(e) = self.store.set_string(SESSION_STATE_KEY, &json) {
                    error!("Failed to persist session state: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize session state: {}", e),
        }
    }
}

fn load_state(store: &dyn StateStore) -> SessionState {
    match store.get_string(SESSION_STATE_KEY) {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Discarding unreadable session state: {}", e);
            SessionState::default()
        }),
        Ok(None) => SessionState::default(),
        Err(e) => {
            error!("Failed to load session state: {}", e);
            SessionState::default()
        }
    }
}
