use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    rate_limited: AtomicU64,
    infra_failures: AtomicU64,
}

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::default);

pub fn record_allowed() {
    COUNTERS.allowed.fetch_add(1, Ordering::Relaxed);
}

pub fn record_denied() {
    COUNTERS.denied.fetch_add(1, Ordering::Relaxed);
}

pub fn record_rate_limited() {
    COUNTERS.rate_limited.fetch_add(1, Ordering::Relaxed);
}

pub fn record_infra_failure() {
    COUNTERS.infra_failures.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Debug, Default)]
pub struct EvaluatorMetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub infra_failures: u64,
}

pub fn snapshot() -> EvaluatorMetricsSnapshot {
    EvaluatorMetricsSnapshot {
        allowed: COUNTERS.allowed.load(Ordering::Relaxed),
        denied: COUNTERS.denied.load(Ordering::Relaxed),
        rate_limited: COUNTERS.rate_limited.load(Ordering::Relaxed),
        infra_failures: COUNTERS.infra_failures.load(Ordering::Relaxed),
    }
}
