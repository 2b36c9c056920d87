use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::AuditError;
use crate::metrics;
use crate::model::{AuditEvent, AuditFilter};

/// Append-only audit sink. `append` must not report success unless the
/// event is guaranteed to be delivered; the evaluator fails closed on an
/// append error.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError>;
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError>;
}

/// Bounded ring used in tests and as the dashboard-facing recent-events
/// view. Oldest events are dropped once capacity is reached.
pub struct InMemoryAuditCenter {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl InMemoryAuditCenter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        })
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditCenter {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut guard = self.events.lock();
        if guard.len() == self.capacity {
            guard.pop_front();
            metrics::record_evicted();
        }
        guard.push_back(event);
        metrics::record_appended();
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        metrics::record_query();
        let guard = self.events.lock();
        let mut out: Vec<AuditEvent> = guard
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

/// Swallows everything; wiring for benches and tests that do not assert on
/// audit output.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuditCenter;

impl NoopAuditCenter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl AuditSink for NoopAuditCenter {
    async fn append(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    async fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuditKind;
    use chrono::Utc;
    use gatehouse_core_types::ActorId;

    #[tokio::test]
    async fn ring_evicts_oldest_when_full() {
        let center = InMemoryAuditCenter::new(2);
        for _ in 0..3 {
            center
                .append(AuditEvent::new(AuditKind::TaskQueued, Utc::now()))
                .await
                .unwrap();
        }
        assert_eq!(center.len(), 2);
    }

    #[tokio::test]
    async fn query_applies_filter_and_limit() {
        let center = InMemoryAuditCenter::new(16);
        let actor = ActorId::new();
        for _ in 0..3 {
            center
                .append(AuditEvent::new(AuditKind::DecisionAllowed, Utc::now()).actor(actor.clone()))
                .await
                .unwrap();
        }
        center
            .append(AuditEvent::new(AuditKind::DecisionDenied, Utc::now()))
            .await
            .unwrap();

        let filter = AuditFilter {
            actor: Some(actor),
            limit: Some(2),
            ..AuditFilter::default()
        };
        let events = center.query(&filter).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| event.kind == AuditKind::DecisionAllowed));
    }
}
