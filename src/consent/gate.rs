//! # Consent Gate
//!
//! Holds ingestion tasks back until the user grants data-collection consent.
//! Consent is one-way (false -> true). On grant the replay buffer is moved
//! into the live queue while the gate lock is held, so every task submitted
//! after the grant lands behind the replayed ones.

use crate::worker::{PendingTask, TaskQueue};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct GateState {
    enabled: bool,
    replay: VecDeque<PendingTask>,
}

pub struct ConsentGate {
    state: Mutex<GateState>,
    queue: Arc<TaskQueue>,
    replay_capacity: usize,
    dropped: Mutex<u64>,
}

impl std::fmt::Debug for ConsentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConsentGate")
            .field("enabled", &state.enabled)
            .field("buffered", &state.replay.len())
            .field("replay_capacity", &self.replay_capacity)
            .finish()
    }
}

impl ConsentGate {
    pub fn new(queue: Arc<TaskQueue>, enabled: bool, replay_capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                enabled,
                replay: VecDeque::new(),
            }),
            queue,
            replay_capacity: replay_capacity.max(1),
            dropped: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().replay.len()
    }

    /// Tasks dropped because the replay buffer was full.
    pub fn dropped(&self) -> u64 {
        *self.dropped.lock()
    }

    /// Route a task to the live queue or hold it for replay.
    pub fn submit(&self, task: PendingTask) {
        let mut state = self.state.lock();
        if state.enabled {
            self.queue.push(task);
            return;
        }

        if state.replay.len() >= self.replay_capacity {
            *self.dropped.lock() += 1;
            warn!(
                "Replay buffer full ({}), dropping task '{}'",
                self.replay_capacity,
                task.label()
            );
            return;
        }
        state.replay.push_back(task);
    }

    /// Enable collection and release buffered tasks in submission order.
    /// Returns the number of replayed tasks.
    pub fn grant_consent(&self) -> usize {
        let mut state = self.state.lock();
        if state.enabled {
            return 0;
        }
        state.enabled = true;

        let replayed = state.replay.len();
        self.queue.push_all(state.replay.drain(..));
        info!("Data collection enabled, replaying {} buffered tasks", replayed);
        replayed
    }
}
