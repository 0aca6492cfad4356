use crate::error::{AgentError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::Write;

/// One upload: the decoded events and their gzipped JSON array.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub events: Vec<Value>,
    pub body: Vec<u8>,
    /// Highest sequence id covered by this batch
    pub high_watermark: i64,
}

impl FlushBatch {
    pub fn new(events: Vec<Value>, high_watermark: i64) -> Result<Self> {
        let json = serde_json::to_vec(&events)?;
        let body = gzip(&json)?;
        Ok(Self {
            events,
            body,
            high_watermark,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Delivers batches to the collection endpoint.
pub trait DeliveryTransport: Send + Sync {
    fn deliver(&self, batch: &FlushBatch) -> Result<()>;
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AgentError::Io(format!("gzip failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| AgentError::Io(format!("gzip failed: {}", e)))
}
