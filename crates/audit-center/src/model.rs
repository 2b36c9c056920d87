use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_core_types::{ActorId, DecisionId, TaskId, TenantId};

/// Event categories recorded by the engine. Decision and task kinds are the
/// compliance-critical ones; the rest cover the identity and administrative
/// lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    DecisionAllowed,
    DecisionDenied,
    TaskQueued,
    TaskAssigned,
    TaskSucceeded,
    TaskFailed,
    TaskCancelled,
    TaskRetried,
    DuplicateCompletion,
    IdentityIssued,
    IdentityRevoked,
    CredentialRotated,
    TenantUpdated,
    TierPublished,
    WorkerRegistered,
    WorkerDeregistered,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::DecisionAllowed => "decision_allowed",
            AuditKind::DecisionDenied => "decision_denied",
            AuditKind::TaskQueued => "task_queued",
            AuditKind::TaskAssigned => "task_assigned",
            AuditKind::TaskSucceeded => "task_succeeded",
            AuditKind::TaskFailed => "task_failed",
            AuditKind::TaskCancelled => "task_cancelled",
            AuditKind::TaskRetried => "task_retried",
            AuditKind::DuplicateCompletion => "duplicate_completion",
            AuditKind::IdentityIssued => "identity_issued",
            AuditKind::IdentityRevoked => "identity_revoked",
            AuditKind::CredentialRotated => "credential_rotated",
            AuditKind::TenantUpdated => "tenant_updated",
            AuditKind::TierPublished => "tier_published",
            AuditKind::WorkerRegistered => "worker_registered",
            AuditKind::WorkerDeregistered => "worker_deregistered",
        }
    }
}

/// One append-only audit record: who, where, what, and a free-form detail
/// payload for the compliance reviewer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub kind: AuditKind,
    pub actor: Option<ActorId>,
    pub tenant: Option<TenantId>,
    pub decision: Option<DecisionId>,
    pub task: Option<TaskId>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recorded_at,
            kind,
            actor: None,
            tenant: None,
            decision: None,
            task: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn decision(mut self, decision: DecisionId) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Constraints accepted by audit queries; all present fields must match.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub actor: Option<ActorId>,
    pub tenant: Option<TenantId>,
    pub kinds: Option<Vec<AuditKind>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(actor) = &self.actor {
            if event.actor.as_ref() != Some(actor) {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if event.tenant.as_ref() != Some(tenant) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.recorded_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.recorded_at >= to {
                return false;
            }
        }
        true
    }
}
