//! # Event Record Codec
//!
//! Turns a validated [`EventPayload`] into the sealed bytes stored by the
//! event store, and back into JSON on the flush path. Sealing goes through
//! the host-provided [`RecordSealer`]; the construction itself is not this
//! crate's concern.

use super::payload::EventPayload;
use crate::error::{AgentError, Result};
use serde_json::Value;
use std::sync::Arc;

/// Encryption seam around stored records.
pub trait RecordSealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Stores records as plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSealer;

impl RecordSealer for PassthroughSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

#[derive(Clone)]
pub struct EventRecordCodec {
    sealer: Arc<dyn RecordSealer>,
}

impl std::fmt::Debug for EventRecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecordCodec").finish_non_exhaustive()
    }
}

impl Default for EventRecordCodec {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughSealer))
    }
}

impl EventRecordCodec {
    pub fn new(sealer: Arc<dyn RecordSealer>) -> Self {
        Self { sealer }
    }

    /// Serialize and seal a payload for storage.
    pub fn encode(&self, payload: &EventPayload) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| AgentError::Serialization(format!("Failed to serialize event: {}", e)))?;
        self.sealer
            .seal(&json)
            .map_err(|e| AgentError::Seal(format!("Failed to seal event: {}", e)))
    }

    /// Unseal a stored record into its JSON object.
    pub fn decode(&self, sealed: &[u8]) -> Result<Value> {
        let json = self
            .sealer
            .unseal(sealed)
            .map_err(|e| AgentError::Seal(format!("Failed to unseal event: {}", e)))?;
        let value: Value = serde_json::from_slice(&json)?;
        if !value.is_object() {
            return Err(AgentError::Serialization(
                "stored event is not a JSON object".to_string(),
            ));
        }
        Ok(value)
    }
}
