//! # Tracker Agent
//!
//! Client-side event tracking agent. Captures analytics events, partitions
//! them into sessions, stores them durably in a bounded local store and
//! delivers them in batches. Remote configuration can switch collection off
//! or blacklist events; consent gating holds events until the user opts in.
//!
//! ## Architecture
//!
//! ```text
//! Tracker ──> ConsentGate ──> TaskQueue ──> IngestionWorker
//!                                                │
//!     RemoteConfigGate · PropertyRegistry · SessionLifecycleManager
//!                                                │
//!                       EventRecordCodec ──> PersistentEventStore
//!                                                │
//!                      FlushService <── FlushScheduler (tokio)
//! ```

pub mod codec;
pub mod config;
pub mod consent;
pub mod error;
pub mod flush;
pub mod refresh;
pub mod remote;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod worker;

pub use codec::{EventBuilder, EventPayload, EventRecordCodec, MergePolicy, PropertyRegistry, RecordSealer};
pub use config::AgentConfig;
pub use consent::ConsentGate;
pub use error::{AgentError, Result};
pub use flush::{DeliveryTransport, FlushBatch, FlushOutcome, FlushService};
pub use refresh::SchedulerConfig;
pub use remote::{ConfigSource, FetchScheduleMode, RemoteConfig, RemoteConfigGate};
pub use session::SessionLifecycleManager;
pub use storage::{MemoryBackend, PersistentEventStore, SqliteBackend, StateStore, StoreBackend};
pub use tracker::{Tracker, TrackerParts, TrackerStats};
pub use types::{now_ms, DebugMode, EventType};
pub use worker::{IngestionWorker, PendingTask, WorkerState};
