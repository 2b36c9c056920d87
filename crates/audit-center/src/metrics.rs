use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    evicted: AtomicU64,
    queries: AtomicU64,
    write_errors: AtomicU64,
}

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::default);

pub fn record_appended() {
    COUNTERS.appended.fetch_add(1, Ordering::Relaxed);
}

pub fn record_evicted() {
    COUNTERS.evicted.fetch_add(1, Ordering::Relaxed);
}

pub fn record_query() {
    COUNTERS.queries.fetch_add(1, Ordering::Relaxed);
}

pub fn record_write_error() {
    COUNTERS.write_errors.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Debug, Default)]
pub struct AuditMetricsSnapshot {
    pub appended: u64,
    pub evicted: u64,
    pub queries: u64,
    pub write_errors: u64,
}

pub fn snapshot() -> AuditMetricsSnapshot {
    AuditMetricsSnapshot {
        appended: COUNTERS.appended.load(Ordering::Relaxed),
        evicted: COUNTERS.evicted.load(Ordering::Relaxed),
        queries: COUNTERS.queries.load(Ordering::Relaxed),
        write_errors: COUNTERS.write_errors.load(Ordering::Relaxed),
    }
}
