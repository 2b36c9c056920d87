use lazy_static::lazy_static;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref DECISIONS: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("gatehouse_decisions_total", "Permission decisions by outcome"),
            &["outcome"],
        )
        .expect("decision metric definition");
        REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("decision metric registration");
        gauge
    };
    static ref TASKS: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("gatehouse_tasks_total", "Task outcomes by status"),
            &["status"],
        )
        .expect("task metric definition");
        REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("task metric registration");
        gauge
    };
}

/// Pull the per-crate atomic counters into the prometheus registry and
/// render the exposition format.
pub fn gather() -> String {
    let decisions = gatehouse_evaluator::metrics::snapshot();
    DECISIONS
        .with_label_values(&["allowed"])
        .set(decisions.allowed as i64);
    DECISIONS
        .with_label_values(&["denied"])
        .set(decisions.denied as i64);
    DECISIONS
        .with_label_values(&["rate_limited"])
        .set(decisions.rate_limited as i64);
    DECISIONS
        .with_label_values(&["infrastructure"])
        .set(decisions.infra_failures as i64);

    let tasks = gatehouse_orchestrator::metrics::snapshot();
    TASKS
        .with_label_values(&["submitted"])
        .set(tasks.submitted as i64);
    TASKS
        .with_label_values(&["succeeded"])
        .set(tasks.succeeded as i64);
    TASKS.with_label_values(&["failed"]).set(tasks.failed as i64);
    TASKS
        .with_label_values(&["retried"])
        .set(tasks.retried as i64);
    TASKS
        .with_label_values(&["cancelled"])
        .set(tasks.cancelled as i64);
    TASKS
        .with_label_values(&["timed_out"])
        .set(tasks.timed_out as i64);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_both_families() {
        let text = gather();
        assert!(text.contains("gatehouse_decisions_total"));
        assert!(text.contains("gatehouse_tasks_total"));
    }
}
