//! Delivery of stored events.

pub mod service;
pub mod transport;

pub use service::{FlushOutcome, FlushService, FlushStats, FLUSH_TIME_KEY};
pub use transport::{gzip, DeliveryTransport, FlushBatch};
