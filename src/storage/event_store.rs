//! # Persistent Event Store
//!
//! Size-capped FIFO store of sealed event records on top of a
//! [`StoreBackend`].
//!
//! Before each append the backend footprint is compared against the cap. At
//! or above the cap the oldest [`EVICTION_SWEEP_SIZE`] records are removed
//! and the footprint re-checked; if it is still too large the append is
//! refused with [`AgentError::StorageFull`] and nothing is written.
//!
//! Reads verify each record's CRC-32 tag. Records that fail are left out of
//! the batch but still covered by its high watermark, so the next watermark
//! delete clears them together with their neighbors.

use super::types::{integrity_tag, EventRecord, ReadBatch, StoreBackend, StoreStats};
use crate::config::MIN_MAX_CACHE_SIZE;
use crate::error::{AgentError, Result};
use crate::types::{now_ms, EVICTION_SWEEP_SIZE};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct PersistentEventStore {
    backend: Arc<dyn StoreBackend>,
    /// Byte cap, never below 16 MiB
    max_cache_size: u64,
    /// Serializes the check-evict-insert sequence of `append`
    append_lock: Mutex<()>,
    stats: Mutex<StoreStats>,
}

impl std::fmt::Debug for PersistentEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentEventStore")
            .field("max_cache_size", &self.max_cache_size)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl PersistentEventStore {
    /// Wrap a backend. Caps below 16 MiB are raised to 16 MiB.
    pub fn new(backend: Arc<dyn StoreBackend>, max_cache_size: u64) -> Self {
        Self {
            backend,
            max_cache_size: max_cache_size.max(MIN_MAX_CACHE_SIZE),
            append_lock: Mutex::new(()),
            stats: Mutex::new(StoreStats::default()),
        }
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    /// Durably append one sealed payload.
    ///
    /// When the footprint has reached the cap, the oldest sweep of records is
    /// evicted first.
    ///
    /// # Arguments
    /// - `payload`: Sealed record bytes as produced by the record codec
    ///
    /// # Returns
    /// - `Ok(i64)`: Sequence id of the new record, greater than every earlier id
    /// - `Err(AgentError::StorageFull)`: Still at the cap after eviction
    /// - `Err(_)`: Backend failure
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use tracker::{MemoryBackend, PersistentEventStore};
    ///
    /// let store = PersistentEventStore::new(Arc::new(MemoryBackend::new()), 0);
    /// let _id = store.append(br#"{"event":"Open"}"#)?;
    /// # Ok::<(), tracker::AgentError>(())
    /// ```
    pub fn append(&self, payload: &[u8]) -> Result<i64> {
        let _guard = self.append_lock.lock();

        let footprint = self.backend.footprint_bytes().map_err(|e| {
            error!("Failed to read store footprint: {}", e);
            e
        })?;

        if footprint >= self.max_cache_size {
            info!(
                "Store footprint {} bytes reached cap {}, deleting {} oldest events",
                footprint, self.max_cache_size, EVICTION_SWEEP_SIZE
            );
            self.evict_oldest(EVICTION_SWEEP_SIZE)?;

            let after = self.backend.footprint_bytes()?;
            if after >= self.max_cache_size {
                self.stats.lock().rejected_full += 1;
                warn!(
                    "Store still full after eviction ({} bytes, cap {}), dropping event",
                    after, self.max_cache_size
                );
                return Err(AgentError::StorageFull {
                    footprint: after,
                    cap: self.max_cache_size,
                });
            }
        }

        let sequence_id = self
            .backend
            .insert(payload, integrity_tag(payload), now_ms())
            .map_err(|e| {
                error!("Failed to append event: {}", e);
                e
            })?;

        self.stats.lock().appended += 1;
        Ok(sequence_id)
    }

    /// Remove up to `n` oldest records, returning how many went away.
    fn evict_oldest(&self, n: usize) -> Result<usize> {
        let oldest = self.backend.oldest(n)?;
        let Some(last) = oldest.last() else {
            return Ok(0);
        };

        let removed = self.backend.delete_up_to(last.sequence_id)?;
        self.stats.lock().evicted += removed as u64;
        Ok(removed)
    }

    /// Up to `limit` oldest records with verified integrity tags.
    ///
    /// Storage faults degrade to an empty batch.
    pub fn read_batch(&self, limit: usize) -> ReadBatch {
        let rows = match self.backend.oldest(limit) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Could not read pending events, waiting for next attempt: {}", e);
                return ReadBatch::default();
            }
        };

        let mut batch = ReadBatch {
            records: Vec::with_capacity(rows.len()),
            corrupt: Vec::new(),
            high_watermark: rows.last().map(|row| row.sequence_id),
        };

        for row in rows {
            if integrity_tag(&row.payload) != row.integrity_tag {
                warn!("Record {} failed integrity check, skipping", row.sequence_id);
                batch.corrupt.push(row.sequence_id);
                continue;
            }
            batch.records.push(EventRecord {
                sequence_id: row.sequence_id,
                payload: row.payload,
                created_at: row.created_at,
            });
        }

        if !batch.corrupt.is_empty() {
            self.stats.lock().corrupt_skipped += batch.corrupt.len() as u64;
        }

        batch
    }

    /// Watermark delete: remove every record with id `<= sequence_id`.
    pub fn delete_up_to(&self, sequence_id: i64) -> Result<usize> {
        self.backend.delete_up_to(sequence_id).map_err(|e| {
            error!("Failed to delete events up to {}: {}", sequence_id, e);
            e
        })
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.backend.delete_all().map_err(|e| {
            error!("Failed to delete all events: {}", e);
            e
        })
    }

    /// Pending record count; 0 when the backend is unavailable.
    pub fn count(&self) -> u64 {
        self.backend.count().unwrap_or_else(|e| {
            error!("Failed to count events: {}", e);
            0
        })
    }

    pub fn footprint_bytes(&self) -> u64 {
        self.backend.footprint_bytes().unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryBackend, ROW_OVERHEAD_BYTES};
    use crate::types::MIB;

    fn memory_store(cap: u64) -> (Arc<MemoryBackend>, PersistentEventStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = PersistentEventStore::new(backend.clone(), cap);
        (backend, store)
    }

    #[test]
    fn test_cap_floor_enforced() {
        let (_, store) = memory_store(MIB);
        assert_eq!(store.max_cache_size(), 16 * MIB);
    }

    #[test]
    fn test_read_batch_fifo_and_watermark() {
        let (_, store) = memory_store(16 * MIB);
        let ids: Vec<i64> = (0..10)
            .map(|i| store.append(format!("e{}", i).as_bytes()).unwrap())
            .collect();

        let batch = store.read_batch(4);
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.records[0].payload, b"e0");
        assert_eq!(batch.high_watermark, Some(ids[3]));

        store.delete_up_to(ids[3]).unwrap();
        let batch = store.read_batch(100);
        assert_eq!(batch.records.len(), 6);
        assert!(batch.records.iter().all(|r| r.sequence_id > ids[3]));
        assert_eq!(batch.records[0].payload, b"e4");
    }

    #[test]
    fn test_corrupt_record_skipped_but_covered() {
        let (backend, store) = memory_store(16 * MIB);
        let a = store.append(b"a").unwrap();
        let b = store.append(b"b").unwrap();
        let c = store.append(b"c").unwrap();
        backend.corrupt_record(b);

        let batch = store.read_batch(10);
        let seen: Vec<i64> = batch.records.iter().map(|r| r.sequence_id).collect();
        assert_eq!(seen, vec![a, c]);
        assert_eq!(batch.corrupt, vec![b]);
        assert_eq!(batch.high_watermark, Some(c));
        assert_eq!(store.stats().corrupt_skipped, 1);

        store.delete_up_to(c).unwrap();
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_eviction_removes_exactly_one_sweep() {
        let cap = 16 * MIB;
        let (_, store) = memory_store(cap);
        let payload = vec![b'p'; 64 * 1024];
        let per_row = payload.len() as u64 + ROW_OVERHEAD_BYTES;

        // Fill until the footprint reaches the cap.
        let mut appended = 0u64;
        while store.footprint_bytes() < cap {
            store.append(&payload).unwrap();
            appended += 1;
        }
        assert_eq!(store.count(), appended);
        assert!(appended * per_row >= cap);

        let first_before = store.read_batch(1).records[0].sequence_id;
        store.append(&payload).unwrap();

        // 100 evicted, 1 added.
        assert_eq!(store.count(), appended - 100 + 1);
        assert_eq!(store.stats().evicted, 100);
        let first_after = store.read_batch(1).records[0].sequence_id;
        assert_eq!(first_after, first_before + 100);
    }

    #[test]
    fn test_sweep_frees_oversized_record() {
        let cap = 16 * MIB;
        let (_, store) = memory_store(cap);
        let huge = vec![0u8; (cap + 1) as usize];
        store.append(&huge).unwrap();

        // Footprint is over cap; the sweep removes the single record and the
        // next insert succeeds.
        let id = store.append(b"small").unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.read_batch(1).records[0].sequence_id, id);
    }

    #[test]
    fn test_storage_full_with_empty_sweep() {
        struct FullBackend(MemoryBackend);
        impl StoreBackend for FullBackend {
            fn insert(&self, p: &[u8], t: u32, c: u64) -> Result<i64> {
                self.0.insert(p, t, c)
            }
            fn oldest(&self, limit: usize) -> Result<Vec<crate::storage::StoredRow>> {
                self.0.oldest(limit)
            }
            fn delete_up_to(&self, id: i64) -> Result<usize> {
                self.0.delete_up_to(id)
            }
            fn delete_all(&self) -> Result<usize> {
                self.0.delete_all()
            }
            fn count(&self) -> Result<u64> {
                self.0.count()
            }
            fn footprint_bytes(&self) -> Result<u64> {
                Ok(u64::MAX)
            }
        }

        let store = PersistentEventStore::new(Arc::new(FullBackend(MemoryBackend::new())), 0);
        let err = store.append(b"lost").unwrap_err();
        assert!(matches!(err, AgentError::StorageFull { .. }));
        assert_eq!(store.count(), 0);
        assert_eq!(store.stats().rejected_full, 1);
    }
}
