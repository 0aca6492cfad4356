//! Ingestion worker and its task queue.

pub mod ingestion;
pub mod queue;

pub use ingestion::{IngestionWorker, WorkerState, WorkerStats, WORKER_THREAD_NAME};
pub use queue::{PendingTask, TaskQueue};
