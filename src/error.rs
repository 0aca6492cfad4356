//! Error taxonomy for the ingestion and delivery pipeline.
//!
//! Every variant is absorbed at the boundary where it occurs: the worker logs
//! and drops, the flusher keeps records for the next attempt, the remote
//! config gate keeps its previous policy.

/// Pipeline error kinds.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Append refused after an eviction sweep; the event is lost.
    #[error("storage full: {footprint} bytes used, cap {cap} bytes")]
    StorageFull { footprint: u64, cap: u64 },

    /// Stored record failed checksum or could not be unsealed.
    #[error("integrity failure on record {sequence_id}")]
    IntegrityFailure { sequence_id: i64 },

    /// Delivery of a batch failed; records stay pending.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Remote config could not be fetched.
    #[error("remote config fetch failed: {0}")]
    ConfigFetch(String),

    /// Remote config document could not be parsed.
    #[error("malformed remote config: {0}")]
    MalformedConfig(String),

    #[error("invalid event name: {0}")]
    InvalidEventName(String),

    #[error("invalid property: {0}")]
    InvalidProperty(String),

    /// Storage-layer fault (I/O, SQL).
    #[error("storage error: {0}")]
    Storage(String),

    /// Record sealer refused to seal or unseal.
    #[error("seal error: {0}")]
    Seal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
