use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use gatehouse_core_types::{CorrelationId, TaskId};

use crate::errors::OrchestratorError;
use crate::lanes::CorrelationLanes;
use crate::model::{TaskRecord, TaskStatus};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Bounded retry interval for the scheduling loop when no wake event
    /// arrives.
    pub tick: Duration,
    pub retry_backoff: Duration,
    /// How many memory records to attach to each task.
    pub memory_top_k: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(300),
            memory_top_k: 5,
        }
    }
}

pub(crate) struct TaskCtx {
    pub record: TaskRecord,
    pub cancel: CancellationToken,
}

/// Shared mutable task state: the task table, correlation lanes, and the
/// scheduler wake signal. Per-key locking throughout; there is no global
/// mutex on the submit or completion paths.
pub struct OrchestratorRuntime {
    tasks: DashMap<TaskId, Arc<RwLock<TaskCtx>>>,
    pub(crate) lanes: CorrelationLanes,
    by_correlation: DashMap<CorrelationId, Vec<TaskId>>,
    pub(crate) notify: Notify,
    pub(crate) config: OrchestratorConfig,
}

impl OrchestratorRuntime {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            lanes: CorrelationLanes::new(),
            by_correlation: DashMap::new(),
            notify: Notify::new(),
            config,
        })
    }

    /// Admit a task into the queue and wake the scheduler.
    pub fn admit(&self, record: TaskRecord) {
        let id = record.id.clone();
        let correlation = record.correlation_id.clone();
        self.by_correlation
            .entry(correlation.clone())
            .or_default()
            .push(id.clone());
        self.tasks.insert(
            id.clone(),
            Arc::new(RwLock::new(TaskCtx {
                record,
                cancel: CancellationToken::new(),
            })),
        );
        self.lanes.push_back(correlation, id);
        self.notify.notify_one();
    }

    /// Re-admit a terminal-or-recovered record without resetting indices
    /// (used by restart recovery; terminal records are queryable but take
    /// no lane slot).
    pub fn restore(&self, record: TaskRecord) {
        let id = record.id.clone();
        let correlation = record.correlation_id.clone();
        let queued = record.status == TaskStatus::Queued;
        self.by_correlation
            .entry(correlation.clone())
            .or_default()
            .push(id.clone());
        self.tasks.insert(
            id.clone(),
            Arc::new(RwLock::new(TaskCtx {
                record,
                cancel: CancellationToken::new(),
            })),
        );
        if queued {
            self.lanes.push_back(correlation, id);
            self.notify.notify_one();
        }
    }

    pub fn record(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(id).map(|ctx| ctx.read().record.clone())
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|ctx| ctx.read().record.status)
    }

    pub(crate) fn cancel_token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.tasks.get(id).map(|ctx| ctx.read().cancel.clone())
    }

    /// The full set of task states for a correlation, in submission order,
    /// so a caller can detect "all complete".
    pub fn correlation_states(&self, correlation: &CorrelationId) -> Vec<(TaskId, TaskStatus)> {
        self.by_correlation
            .get(correlation)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.status(id).map(|status| (id.clone(), status)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.lanes.pending()
    }

    /// Validated, monotonic state transition. Returns the updated record;
    /// rejects edges the state machine does not allow.
    pub fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, OrchestratorError> {
        let ctx = self
            .tasks
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownTask(id.clone()))?;
        let mut guard = ctx.write();
        let from = guard.record.status;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition { from, to });
        }
        guard.record.status = to;
        match to {
            TaskStatus::Running => guard.record.started_at = Some(now),
            status if status.is_terminal() => guard.record.completed_at = Some(now),
            _ => {}
        }
        mutate(&mut guard.record);
        Ok(guard.record.clone())
    }

    /// Give a retried task a fresh cancellation token; the previous
    /// attempt may have consumed its token through a timeout.
    pub(crate) fn reset_cancel(&self, id: &TaskId) {
        if let Some(ctx) = self.tasks.get(id) {
            ctx.write().cancel = CancellationToken::new();
        }
    }

    /// Mutate record fields that are not part of the state machine
    /// (annotations like the memory-unavailable flag).
    pub(crate) fn annotate(
        &self,
        id: &TaskId,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Option<TaskRecord> {
        self.tasks.get(id).map(|ctx| {
            let mut guard = ctx.write();
            mutate(&mut guard.record);
            guard.record.clone()
        })
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core_types::{ActionType, ActorId, TenantId};
    use serde_json::json;

    fn record(correlation: &CorrelationId) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(),
            tenant_id: TenantId::new(),
            actor_id: ActorId::new(),
            action: ActionType::ChatReply,
            payload: json!({}),
            resource: None,
            correlation_id: correlation.clone(),
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: 3,
            timeout_ms: 30_000,
            assigned_role: None,
            memory_unavailable: false,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn admit_tracks_correlation_order() {
        let runtime = OrchestratorRuntime::new(OrchestratorConfig::default());
        let correlation = CorrelationId::new();
        let first = record(&correlation);
        let second = record(&correlation);
        let first_id = first.id.clone();
        runtime.admit(first);
        runtime.admit(second);

        let states = runtime.correlation_states(&correlation);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].0, first_id);
        assert!(states.iter().all(|(_, status)| *status == TaskStatus::Queued));
        assert_eq!(runtime.pending(), 2);
    }

    #[test]
    fn transition_rejects_illegal_edges() {
        let runtime = OrchestratorRuntime::new(OrchestratorConfig::default());
        let correlation = CorrelationId::new();
        let task = record(&correlation);
        let id = task.id.clone();
        runtime.admit(task);

        let err = runtime
            .transition(&id, TaskStatus::Running, Utc::now(), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: TaskStatus::Queued,
                to: TaskStatus::Running,
            }
        ));

        runtime
            .transition(&id, TaskStatus::Assigned, Utc::now(), |_| {})
            .unwrap();
        let updated = runtime
            .transition(&id, TaskStatus::Running, Utc::now(), |record| {
                record.attempts += 1;
            })
            .unwrap();
        assert_eq!(updated.attempts, 1);
        assert!(updated.started_at.is_some());
    }

    #[test]
    fn terminal_records_keep_completion_time() {
        let runtime = OrchestratorRuntime::new(OrchestratorConfig::default());
        let correlation = CorrelationId::new();
        let task = record(&correlation);
        let id = task.id.clone();
        runtime.admit(task);
        runtime
            .transition(&id, TaskStatus::Assigned, Utc::now(), |_| {})
            .unwrap();
        runtime
            .transition(&id, TaskStatus::Running, Utc::now(), |_| {})
            .unwrap();
        let done = runtime
            .transition(&id, TaskStatus::Succeeded, Utc::now(), |record| {
                record.result = Some(json!({"ok": true}));
            })
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(runtime
            .transition(&id, TaskStatus::Queued, Utc::now(), |_| {})
            .is_err());
    }
}
