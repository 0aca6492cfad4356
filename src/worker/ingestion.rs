//! # Ingestion Worker
//!
//! Single consumer thread draining the [`TaskQueue`]. Supervised state
//! machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! `stop()` joins the consumer after its current task and leaves queued
//! tasks in place; a later `start()` resumes them in order. A panicking task
//! is caught, logged and counted.

use super::queue::{PendingTask, Signal, TaskQueue};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const WORKER_THREAD_NAME: &str = "tracker-task-queue";

const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    panicked: AtomicU64,
}

pub struct IngestionWorker {
    queue: Arc<TaskQueue>,
    state: Arc<Mutex<WorkerState>>,
    counters: Arc<Counters>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IngestionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionWorker")
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl IngestionWorker {
    /// Create a stopped worker over `queue`.
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            state: Arc::new(Mutex::new(WorkerState::Stopped)),
            counters: Arc::new(Counters::default()),
            join: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Enqueue a task. Runs once the worker is (or becomes) running.
    pub fn submit(&self, task: PendingTask) {
        self.queue.push(task);
    }

    /// Start the consumer thread. No-op unless stopped.
    pub fn start(&self) -> std::io::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Stopped {
                return Ok(());
            }
            *state = WorkerState::Starting;
        }
        self.queue.clear_shutdown();

        let queue = self.queue.clone();
        let state = self.state.clone();
        let counters = self.counters.clone();
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_loop(queue, state, counters));

        match spawned {
            Ok(handle) => {
                *self.join.lock() = Some(handle);
                info!("Ingestion worker started");
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn ingestion worker: {}", e);
                *self.state.lock() = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    /// Stop the consumer after its current task. Queued tasks are kept.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Stopped | WorkerState::Stopping => return,
                _ => *state = WorkerState::Stopping,
            }
        }
        self.queue.signal_shutdown();

        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from a task: the loop exits after this task returns.
                return;
            }
            if handle.join().is_err() {
                error!("Ingestion worker thread terminated abnormally");
            }
        }
        *self.state.lock() = WorkerState::Stopped;
        info!("Ingestion worker stopped ({} tasks queued)", self.queue.len());
    }

    /// Block until every task queued before this call has run.
    ///
    /// Returns `false` if the worker is not running or the wait timed out.
    pub fn drain_and_wait(&self, timeout: Duration) -> bool {
        if self.state() != WorkerState::Running && self.state() != WorkerState::Starting {
            warn!("drain requested while ingestion worker is {:?}", self.state());
            return false;
        }
        let (tx, rx) = mpsc::channel();
        self.queue.push(PendingTask::new("drain-barrier", move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for IngestionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(queue: Arc<TaskQueue>, state: Arc<Mutex<WorkerState>>, counters: Arc<Counters>) {
    {
        let mut guard = state.lock();
        if *guard == WorkerState::Starting {
            *guard = WorkerState::Running;
        }
    }

    loop {
        match queue.next(IDLE_POLL) {
            Some(Signal::Task(task)) => {
                let label = task.label().to_string();
                match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                    Ok(()) => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => {
                        counters.panicked.fetch_add(1, Ordering::Relaxed);
                        error!("Task '{}' panicked: {}", label, panic_message(&payload));
                    }
                }
            }
            Some(Signal::Shutdown) => break,
            None => continue,
        }
    }

    let mut guard = state.lock();
    if *guard == WorkerState::Stopping {
        *guard = WorkerState::Stopped;
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn recording_task(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> PendingTask {
        let log = log.clone();
        PendingTask::new(format!("task-{}", n), move || log.lock().push(n))
    }

    #[test]
    fn test_runs_tasks_in_order() {
        let worker = IngestionWorker::new(Arc::new(TaskQueue::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        worker.start().unwrap();
        for n in 0..50 {
            worker.submit(recording_task(&log, n));
        }
        assert!(worker.drain_and_wait(WAIT));
        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
        assert!(worker.stats().processed >= 50);
    }

    #[test]
    fn test_start_is_idempotent() {
        let worker = IngestionWorker::new(Arc::new(TaskQueue::new()));
        worker.start().unwrap();
        worker.start().unwrap();
        assert!(worker.drain_and_wait(WAIT));
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.stop();
    }

    #[test]
    fn test_stop_keeps_queued_tasks() {
        let worker = IngestionWorker::new(Arc::new(TaskQueue::new()));
        let log = Arc::new(Mutex::new(Vec::new()));

        worker.start().unwrap();
        worker.submit(recording_task(&log, 1));
        assert!(worker.drain_and_wait(WAIT));
        worker.stop();

        worker.submit(recording_task(&log, 2));
        worker.submit(recording_task(&log, 3));
        assert_eq!(worker.queue().len(), 2);
        assert!(!worker.drain_and_wait(Duration::from_millis(10)));

        worker.start().unwrap();
        assert!(worker.drain_and_wait(WAIT));
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let worker = IngestionWorker::new(Arc::new(TaskQueue::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        worker.start().unwrap();

        worker.submit(PendingTask::new("boom", || panic!("boom")));
        worker.submit(recording_task(&log, 7));
        assert!(worker.drain_and_wait(WAIT));

        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(worker.stats().panicked, 1);
        assert_eq!(worker.state(), WorkerState::Running);
    }

    #[test]
    fn test_runs_on_named_thread() {
        let worker = IngestionWorker::new(Arc::new(TaskQueue::new()));
        let name = Arc::new(Mutex::new(None));
        worker.start().unwrap();
        {
            let name = name.clone();
            worker.submit(PendingTask::new("name", move || {
                *name.lock() = thread::current().name().map(str::to_string);
            }));
        }
        assert!(worker.drain_and_wait(WAIT));
        assert_eq!(name.lock().as_deref(), Some(WORKER_THREAD_NAME));
    }
}
