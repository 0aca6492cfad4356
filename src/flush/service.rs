//! # Flush Service
//!
//! Moves stored events to the collection endpoint, oldest first.
//!
//! **Algorithm** (`flush_once`):
//! - Read up to `batch_size` records; corrupt ones are skipped but covered
//!   by the batch watermark
//! - Decode each record and stamp `_flush_time`
//! - Deliver the gzipped JSON array
//! - On success delete everything up to the watermark; on failure keep it
//!
//! A batch made only of unreadable records is deleted without delivery.

use super::transport::{DeliveryTransport, FlushBatch};
use crate::codec::EventRecordCodec;
use crate::error::{AgentError, Result};
use crate::storage::PersistentEventStore;
use crate::types::now_ms;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

pub const FLUSH_TIME_KEY: &str = "_flush_time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing stored
    Empty,
    /// Batch delivered and deleted
    Delivered { sent: usize, skipped: usize },
    /// Batch held only unreadable records and was deleted
    Discarded { skipped: usize },
}

/// Statistics across flush rounds.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    /// Batches delivered successfully
    pub batches_delivered: u64,
    /// Events delivered successfully
    pub events_delivered: u64,
    /// Unreadable records dropped
    pub records_discarded: u64,
    /// Failed deliveries
    pub failures: u64,
    /// Timestamp of the last successful delivery
    pub last_delivered_at: Option<u64>,
    /// Duration of the last round in milliseconds
    pub last_duration_ms: u64,
}

pub struct FlushService {
    store: Arc<PersistentEventStore>,
    codec: EventRecordCodec,
    transport: Arc<dyn DeliveryTransport>,
    batch_size: usize,
    // One round at a time so a batch is never sent twice.
    round: Mutex<()>,
    stats: Mutex<FlushStats>,
}

impl std::fmt::Debug for FlushService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushService")
            .field("batch_size", &self.batch_size)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl FlushService {
    pub fn new(
        store: Arc<PersistentEventStore>,
        codec: EventRecordCodec,
        transport: Arc<dyn DeliveryTransport>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            codec,
            transport,
            batch_size: batch_size.max(1),
            round: Mutex::new(()),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> FlushStats {
        self.stats.lock().clone()
    }

    /// Deliver the oldest batch.
    ///
    /// Records that fail their integrity check or do not decode are skipped
    /// but still covered by the deletion watermark.
    ///
    /// # Returns
    /// - `Ok(FlushOutcome::Empty)`: Nothing stored
    /// - `Ok(FlushOutcome::Delivered { .. })`: Batch accepted and deleted
    /// - `Ok(FlushOutcome::Discarded { .. })`: Batch held only unreadable records
    /// - `Err(_)`: Delivery failed; records stay for the next round
    ///
    /// # Example
    /// ```rust,ignore
    /// let outcome = flush.flush_once()?;
    /// println!("flush round: {:?}", outcome);
    /// ```
    pub fn flush_once(&self) -> Result<FlushOutcome> {
        let _round = self.round.lock();
        let start = now_ms();

        let batch = self.store.read_batch(self.batch_size);
        let Some(high_watermark) = batch.high_watermark else {
            return Ok(FlushOutcome::Empty);
        };

        let mut skipped = batch.corrupt.len();
        let flush_time = now_ms();
        let mut events = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            match self.codec.decode(&record.payload) {
                Ok(mut event) => {
                    if let Value::Object(map) = &mut event {
                        map.insert(FLUSH_TIME_KEY.to_string(), Value::from(flush_time));
                    }
                    events.push(event);
                }
                Err(e) => {
                    let failure = AgentError::IntegrityFailure {
                        sequence_id: record.sequence_id,
                    };
                    warn!("{}: {}", failure, e);
                    skipped += 1;
                }
            }
        }

        if events.is_empty() {
            self.store.delete_up_to(high_watermark)?;
            warn!(
                "Discarded {} unreadable records up to #{}",
                skipped, high_watermark
            );
            self.stats.lock().records_discarded += skipped as u64;
            return Ok(FlushOutcome::Discarded { skipped });
        }

        let upload = FlushBatch::new(events, high_watermark)?;
        if let Err(e) = self.transport.deliver(&upload) {
            let mut stats = self.stats.lock();
            stats.failures += 1;
            stats.last_duration_ms = now_ms().saturating_sub(start);
            warn!("Flush failed, {} events kept: {}", upload.len(), e);
            return Err(e);
        }

        self.store.delete_up_to(high_watermark)?;
        let sent = upload.len();
        debug!("delivered {} events up to #{}", sent, high_watermark);

        let mut stats = self.stats.lock();
        stats.batches_delivered += 1;
        stats.events_delivered += sent as u64;
        stats.records_discarded += skipped as u64;
        stats.last_delivered_at = Some(now_ms());
        stats.last_duration_ms = now_ms().saturating_sub(start);

        Ok(FlushOutcome::Delivered { sent, skipped })
    }

    /// Deliver batches until the store is empty or a delivery fails.
    /// Returns the number of events delivered.
    pub fn flush_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.flush_once()? {
                FlushOutcome::Empty => break,
                FlushOutcome::Delivered { sent, .. } => total += sent,
                FlushOutcome::Discarded { .. } => {}
            }
        }
        if total > 0 {
            info!("Flushed {} events", total);
        }
        Ok(total)
    }
}
