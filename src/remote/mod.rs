//! Remote collection control.
//!
//! - [`config`]: the wire document and its parsed form
//! - [`gate`]: active config, cache and apply rules
//! - [`schedule`]: randomized fetch anchor
//! - [`source`]: where documents come from

pub mod config;
pub mod gate;
pub mod schedule;
pub mod source;

pub use config::RemoteConfig;
pub use gate::{FetchOutcome, RemoteConfigGate, REMOTE_CONFIG_KEY};
pub use schedule::{FetchAnchor, FetchSchedule, FetchScheduleMode};
pub use source::ConfigSource;
