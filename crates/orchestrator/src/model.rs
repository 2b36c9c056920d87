use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gatehouse_core_types::{ActionType, ActorId, CorrelationId, RoleId, TaskId, TenantId};

use crate::memory::MemorySnippet;

/// Task lifecycle. Transitions are monotonic: `Succeeded` and `Cancelled`
/// are immutable, `Failed` is terminal once the attempt budget is spent,
/// and the only path back to `Queued` is an explicit retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    /// Cooperative cancellation was requested while running; the task
    /// finalizes when the worker reports back.
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal state-machine edges. Retry (`Running -> Queued`) is included;
    /// attempt accounting happens at the call site.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelling)
                | (Cancelling, Succeeded)
                | (Cancelling, Failed)
                | (Cancelling, Cancelled)
        )
    }
}

/// Caller input to `submit`.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub actor_id: ActorId,
    pub action: ActionType,
    pub payload: Value,
    pub resource: Option<String>,
    /// Sub-tasks of one originating request share a correlation id; their
    /// assignment preserves submission order.
    pub correlation: Option<CorrelationId>,
}

impl SubmitRequest {
    pub fn new(actor_id: ActorId, action: ActionType, payload: Value) -> Self {
        Self {
            actor_id,
            action,
            payload,
            resource: None,
            correlation: None,
        }
    }

    pub fn correlated(mut self, correlation: CorrelationId) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

/// Persisted task snapshot; one of these is journaled on every transition
/// and handed to the audit log once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub action: ActionType,
    pub payload: Value,
    pub resource: Option<String>,
    pub correlation_id: CorrelationId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub assigned_role: Option<RoleId>,
    pub memory_unavailable: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Broadcast on every transition so callers can subscribe instead of
/// polling for completion.
#[derive(Clone, Debug)]
pub struct TaskEvent {
    pub task: TaskId,
    pub correlation: CorrelationId,
    pub status: TaskStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Memory context attached to a task before dispatch. A memory-service
/// failure degrades to `unavailable = true` rather than failing the task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryAttachment {
    pub snippets: Vec<MemorySnippet>,
    pub unavailable: bool,
}

/// Everything a worker needs to execute one task.
#[derive(Clone, Debug)]
pub struct WorkAssignment {
    pub task: TaskRecord,
    pub role: RoleId,
    pub memory: MemoryAttachment,
}
