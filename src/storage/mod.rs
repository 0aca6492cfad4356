//! Durable storage for pending events and agent state.
//!
//! - **Backends**: SQLite (default, on disk or in memory) and a volatile
//!   in-memory store, both behind [`StoreBackend`] and [`StateStore`].
//! - **PersistentEventStore**: size cap, low-memory eviction, integrity
//!   tags and watermark deletes on top of any backend.

pub mod event_store;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use event_store::PersistentEventStore;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use types::{
    integrity_tag, EventRecord, ReadBatch, StateStore, StoreBackend, StoreStats, StoredRow,
};
