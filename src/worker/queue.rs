//! Blocking FIFO task queue shared by producers and the ingestion thread.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// A unit of ingestion work.
pub struct PendingTask {
    label: String,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl PendingTask {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn run(self) {
        (self.run)()
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Signal {
    Task(PendingTask),
    Shutdown,
}

struct QueueState {
    tasks: VecDeque<PendingTask>,
    shutdown: bool,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, task: PendingTask) {
        let mut state = self.state.lock();
        state.tasks.push_back(task);
        self.cv.notify_one();
    }

    /// Push several tasks atomically, preserving their order.
    pub fn push_all(&self, tasks: impl IntoIterator<Item = PendingTask>) {
        let mut state = self.state.lock();
        state.tasks.extend(tasks);
        self.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next signal. A pending shutdown takes precedence over
    /// queued work, which stays in the queue.
    pub(crate) fn next(&self, timeout: Duration) -> Option<Signal> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                state.shutdown = false;
                return Some(Signal::Shutdown);
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(Signal::Task(task));
            }
            if self.cv.wait_for(&mut state, timeout).timed_out() {
                return None;
            }
        }
    }

    pub(crate) fn signal_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cv.notify_all();
    }

    pub(crate) fn clear_shutdown(&self) {
        self.state.lock().shutdown = false;
    }
}
