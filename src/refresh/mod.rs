//! Background schedulers.
//!
//! 1. **Flush** (FlushScheduler): periodic delivery, woken early at bulk size
//! 2. **Remote config** (RemoteConfigScheduler): randomized config polling
//! 3. **Heartbeat** (SessionHeartbeat): idle session rotation

pub mod scheduler;

pub use scheduler::{
    ConfigUpdateHook, FlushScheduler, RemoteConfigScheduler, SchedulerConfig, SessionHeartbeat,
};
