//! In-memory backend for hosts without a writable data directory.
//!
//! Footprint is the sum of payload sizes plus a fixed per-row overhead, so
//! the size cap behaves the same way it does on disk.

use super::types::{StateStore, StoreBackend, StoredRow};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Bytes accounted for each row beyond its payload.
pub const ROW_OVERHEAD_BYTES: u64 = 32;

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, StoredRow>,
    next_id: i64,
    bytes: u64,
    state: HashMap<String, String>,
}

/// Volatile store; ids stay monotonic for the lifetime of the instance.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_record(&self, sequence_id: i64) {
        if let Some(row) = self.inner.lock().rows.get_mut(&sequence_id) {
            row.integrity_tag = row.integrity_tag.wrapping_add(1);
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn insert(&self, payload: &[u8], integrity_tag: u32, created_at: u64) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let sequence_id = inner.next_id;
        inner.bytes += payload.len() as u64 + ROW_OVERHEAD_BYTES;
        inner.rows.insert(
            sequence_id,
            StoredRow {
                sequence_id,
                payload: payload.to_vec(),
                integrity_tag,
                created_at,
            },
        );
        Ok(sequence_id)
    }

    fn oldest(&self, limit: usize) -> Result<Vec<StoredRow>> {
        let inner = self.inner.lock();
        Ok(inner.rows.values().take(limit).cloned().collect())
    }

    fn delete_up_to(&self, sequence_id: i64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let keep = inner.rows.split_off(&(sequence_id.saturating_add(1)));
        let removed = std::mem::replace(&mut inner.rows, keep);
        let freed: u64 = removed
            .values()
            .map(|row| row.payload.len() as u64 + ROW_OVERHEAD_BYTES)
            .sum();
        inner.bytes = inner.bytes.saturating_sub(freed);
        Ok(removed.len())
    }

    fn delete_all(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let removed = inner.rows.len();
        inner.rows.clear();
        inner.bytes = 0;
        Ok(removed)
    }

    fn count(&self) -> Result<u64> {
        Ok(self.inner.lock().rows.len() as u64)
    }

    fn footprint_bytes(&self) -> Result<u64> {
        Ok(self.inner.lock().bytes)
    }
}

impl StateStore for MemoryBackend {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().state.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.lock().state.remove(key);
        Ok(())
    }
}
