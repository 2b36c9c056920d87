use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    denied: AtomicU64,
    assigned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    duplicate_completions: AtomicU64,
}

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::default);

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn record_submitted() {
    increment(&COUNTERS.submitted);
}

pub fn record_denied() {
    increment(&COUNTERS.denied);
}

pub fn record_assigned() {
    increment(&COUNTERS.assigned);
}

pub fn record_succeeded() {
    increment(&COUNTERS.succeeded);
}

pub fn record_failed() {
    increment(&COUNTERS.failed);
}

pub fn record_retried() {
    increment(&COUNTERS.retried);
}

pub fn record_cancelled() {
    increment(&COUNTERS.cancelled);
}

pub fn record_timed_out() {
    increment(&COUNTERS.timed_out);
}

pub fn record_duplicate_completion() {
    increment(&COUNTERS.duplicate_completions);
}

#[derive(Clone, Debug, Default)]
pub struct OrchestratorMetricsSnapshot {
    pub submitted: u64,
    pub denied: u64,
    pub assigned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub duplicate_completions: u64,
}

pub fn snapshot() -> OrchestratorMetricsSnapshot {
    OrchestratorMetricsSnapshot {
        submitted: COUNTERS.submitted.load(Ordering::Relaxed),
        denied: COUNTERS.denied.load(Ordering::Relaxed),
        assigned: COUNTERS.assigned.load(Ordering::Relaxed),
        succeeded: COUNTERS.succeeded.load(Ordering::Relaxed),
        failed: COUNTERS.failed.load(Ordering::Relaxed),
        retried: COUNTERS.retried.load(Ordering::Relaxed),
        cancelled: COUNTERS.cancelled.load(Ordering::Relaxed),
        timed_out: COUNTERS.timed_out.load(Ordering::Relaxed),
        duplicate_completions: COUNTERS.duplicate_completions.load(Ordering::Relaxed),
    }
}
