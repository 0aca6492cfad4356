//! Session partitioning of track events.

pub mod manager;

pub use manager::{SessionLifecycleManager, SessionPhase, SessionState, SESSION_STATE_KEY};
