//! Storage data structures and traits.
//!
//! Defines the record types and the backend seams shared by the SQLite and
//! in-memory stores.

use crate::error::Result;
use flate2::Crc;

/// One pending event as stored by a backend, before integrity checking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    /// Store-assigned id, strictly increasing for the store's lifetime
    pub sequence_id: i64,
    /// Sealed payload bytes
    pub payload: Vec<u8>,
    /// CRC-32 over `payload`, written at append time
    pub integrity_tag: u32,
    /// Capture time (Unix timestamp ms)
    pub created_at: u64,
}

/// A record that passed integrity verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence_id: i64,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

/// Result of reading the oldest pending records.
#[derive(Clone, Debug, Default)]
pub struct ReadBatch {
    /// Verified records, oldest first
    pub records: Vec<EventRecord>,
    /// Records skipped because their tag did not verify
    pub corrupt: Vec<i64>,
    /// Highest sequence id covered by this batch, corrupt records included
    pub high_watermark: Option<i64>,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.high_watermark.is_none()
    }
}

/// Counters kept by the persistent store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records successfully appended
    pub appended: u64,
    /// Records removed by low-memory sweeps
    pub evicted: u64,
    /// Appends refused with `StorageFull`
    pub rejected_full: u64,
    /// Records excluded from batches by integrity checks
    pub corrupt_skipped: u64,
}

/// Durable, key-ordered event storage.
///
/// Implementations must give every inserted row an id greater than any id
/// they ever handed out, including across reopen, and must be safe to call
/// from several threads (each call is its own isolation unit).
pub trait StoreBackend: Send + Sync {
    /// Insert one row and return its id.
    fn insert(&self, payload: &[u8], integrity_tag: u32, created_at: u64) -> Result<i64>;

    /// Up to `limit` rows in ascending id order.
    fn oldest(&self, limit: usize) -> Result<Vec<StoredRow>>;

    /// Delete rows with id `<= sequence_id`, returning how many were removed.
    fn delete_up_to(&self, sequence_id: i64) -> Result<usize>;

    fn delete_all(&self) -> Result<usize>;

    fn count(&self) -> Result<u64>;

    /// Bytes currently used by the backend.
    fn footprint_bytes(&self) -> Result<u64>;
}

/// Small string key/value store for agent state that must survive restarts
/// (session, fetch schedule anchor, cached remote config).
pub trait StateStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// CRC-32 integrity tag over a stored payload.
pub fn integrity_tag(payload: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(payload);
    crc.sum()
}
