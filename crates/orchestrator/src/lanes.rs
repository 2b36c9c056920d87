use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use gatehouse_core_types::{CorrelationId, TaskId};

/// FIFO queues keyed by correlation id, drained round-robin.
///
/// Only the head of each lane is assignable, which is what preserves
/// submission order among sub-tasks of one originating request; distinct
/// correlations interleave fairly via the rotating cursor.
#[derive(Default)]
pub struct CorrelationLanes {
    lanes: DashMap<CorrelationId, Arc<Mutex<VecDeque<TaskId>>>>,
    order: Mutex<Vec<CorrelationId>>,
    cursor: AtomicUsize,
}

impl CorrelationLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, correlation: CorrelationId, task: TaskId) {
        self.lane(&correlation).lock().push_back(task);
        self.track(correlation);
    }

    /// Requeue at the front so a retried task keeps its submission-order
    /// slot within the correlation.
    pub fn push_front(&self, correlation: CorrelationId, task: TaskId) {
        self.lane(&correlation).lock().push_front(task);
        self.track(correlation);
    }

    /// Snapshot of each lane's head, starting from the rotating cursor so
    /// no correlation is starved.
    pub fn heads(&self) -> Vec<(CorrelationId, TaskId)> {
        let order = self.order.lock();
        if order.is_empty() {
            return Vec::new();
        }
        let len = order.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        let mut out = Vec::new();
        for offset in 0..len {
            let key = &order[(start + offset) % len];
            if let Some(lane) = self.lanes.get(key) {
                if let Some(front) = lane.lock().front().cloned() {
                    out.push((key.clone(), front));
                }
            }
        }
        out
    }

    /// Pop the head of `correlation` iff it is still `expected`.
    pub fn pop_head(&self, correlation: &CorrelationId, expected: &TaskId) -> bool {
        // Clone the lane handle out so no map guard is held across prune.
        let lane = match self.lanes.get(correlation) {
            Some(guard) => Arc::clone(guard.value()),
            None => return false,
        };
        let popped = {
            let mut guard = lane.lock();
            if guard.front() == Some(expected) {
                guard.pop_front();
                true
            } else {
                false
            }
        };
        if popped {
            self.prune(correlation);
        }
        popped
    }

    /// Remove `task` wherever it sits in its lane (cancellation of a
    /// queued task).
    pub fn remove(&self, correlation: &CorrelationId, task: &TaskId) -> bool {
        let lane = match self.lanes.get(correlation) {
            Some(guard) => Arc::clone(guard.value()),
            None => return false,
        };
        let removed = {
            let mut guard = lane.lock();
            let before = guard.len();
            guard.retain(|queued| queued != task);
            guard.len() != before
        };
        if removed {
            self.prune(correlation);
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.lanes.iter().map(|lane| lane.value().lock().len()).sum()
    }

    fn lane(&self, correlation: &CorrelationId) -> Arc<Mutex<VecDeque<TaskId>>> {
        self.lanes
            .entry(correlation.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    fn track(&self, correlation: CorrelationId) {
        let mut order = self.order.lock();
        if !order.iter().any(|existing| existing == &correlation) {
            order.push(correlation);
        }
    }

    fn prune(&self, correlation: &CorrelationId) {
        let empty = self
            .lanes
            .get(correlation)
            .map(|lane| lane.lock().is_empty())
            .unwrap_or(false);
        if empty {
            self.lanes.remove(correlation);
            self.order.lock().retain(|existing| existing != correlation);
        }
    }
}
