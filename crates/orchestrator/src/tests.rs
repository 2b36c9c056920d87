use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use gatehouse_audit_center::{AuditFilter, AuditKind, AuditSink, InMemoryAuditCenter};
use gatehouse_core_types::{
    ActionType, ActorId, Clock, CorrelationId, GateError, SystemClock, TaskId, TierLevel,
};
use gatehouse_evaluator::PermissionEvaluator;
use gatehouse_identity_center::{IdentityConfig, IdentityManager};
use gatehouse_policy_center::{
    default_snapshot, CachedPolicyCenter, InMemoryPolicyBackend, PolicyCenter, Tenant,
};
use gatehouse_rate_limiter::RateLimiter;
use gatehouse_state_store::StateStore;
use gatehouse_worker_registry::{WorkerRegistry, WorkerRoleSpec};

use crate::dispatch::{NoopDispatch, WorkerDispatch};
use crate::memory::{MemoryService, MemorySnippet, NoopMemoryService};
use crate::model::{SubmitRequest, TaskStatus, WorkAssignment};
use crate::orchestrator::Orchestrator;
use crate::runtime::{OrchestratorConfig, OrchestratorRuntime};

struct FailingDispatch;

#[async_trait]
impl WorkerDispatch for FailingDispatch {
    async fn execute(
        &self,
        _assignment: WorkAssignment,
        _cancel: CancellationToken,
    ) -> Result<Value, GateError> {
        Err(GateError::new("worker exploded"))
    }
}

/// Runs until cancelled; models a long-running worker that observes the
/// cooperative cancellation signal.
struct SlowDispatch;

#[async_trait]
impl WorkerDispatch for SlowDispatch {
    async fn execute(
        &self,
        _assignment: WorkAssignment,
        cancel: CancellationToken,
    ) -> Result<Value, GateError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GateError::new("cancelled")),
            _ = sleep(Duration::from_secs(30)) => Ok(json!({ "late": true })),
        }
    }
}

struct FailingMemory;

#[async_trait]
impl MemoryService for FailingMemory {
    async fn query(
        &self,
        _actor: &ActorId,
        _context: &str,
        _top_k: usize,
    ) -> Result<Vec<MemorySnippet>, GateError> {
        Err(GateError::new("memory store offline"))
    }

    async fn store(
        &self,
        _actor: &ActorId,
        _content: String,
        _metadata: Value,
    ) -> Result<String, GateError> {
        Err(GateError::new("memory store offline"))
    }
}

struct Fixture<D: WorkerDispatch + 'static> {
    orchestrator: Orchestrator<D>,
    identity: Arc<IdentityManager>,
    audit: Arc<InMemoryAuditCenter>,
    tenant: gatehouse_core_types::TenantId,
}

async fn fixture<D: WorkerDispatch + 'static>(dispatch: Arc<D>) -> Fixture<D> {
    fixture_full(dispatch, NoopMemoryService::new(), None).await
}

async fn fixture_full<D: WorkerDispatch + 'static>(
    dispatch: Arc<D>,
    memory: Arc<dyn MemoryService>,
    store: Option<Arc<StateStore>>,
) -> Fixture<D> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy =
        CachedPolicyCenter::bootstrap(InMemoryPolicyBackend::new(), default_snapshot()).await;
    let tenant = Tenant::new("acme", TierLevel::Enterprise);
    let tenant_id = tenant.id.clone();
    policy.upsert_tenant(tenant).await.unwrap();

    let audit = InMemoryAuditCenter::new(4096);
    let sink: Arc<dyn AuditSink> = audit.clone();
    let identity = IdentityManager::new(
        policy.clone(),
        sink.clone(),
        IdentityConfig::default(),
        clock.clone(),
    );
    let evaluator = PermissionEvaluator::new(
        identity.clone(),
        policy.clone(),
        Arc::new(RateLimiter::new()),
        sink.clone(),
        clock.clone(),
    );
    let runtime = OrchestratorRuntime::new(OrchestratorConfig {
        tick: Duration::from_millis(40),
        retry_backoff: Duration::from_millis(10),
        memory_top_k: 3,
    });
    let orchestrator = Orchestrator::new(
        runtime,
        WorkerRegistry::new(),
        evaluator,
        policy.clone(),
        dispatch,
        memory,
        sink,
        store,
        clock,
    );
    Fixture {
        orchestrator,
        identity,
        audit,
        tenant: tenant_id,
    }
}

async fn actor<D: WorkerDispatch + 'static>(fx: &Fixture<D>, tier: TierLevel) -> ActorId {
    let (actor, _) = fx
        .identity
        .issue_human_identity(fx.tenant.clone(), tier)
        .await
        .unwrap();
    actor.id
}

async fn wait_for_status<D: WorkerDispatch + 'static>(
    orchestrator: &Orchestrator<D>,
    task: &TaskId,
    expected: TaskStatus,
) {
    for _ in 0..400 {
        if orchestrator.task(task).map(|record| record.status) == Some(expected) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task {task} never reached {expected:?}; last status {:?}",
        orchestrator.task(task).map(|record| record.status)
    );
}

async fn audit_count(audit: &InMemoryAuditCenter, kind: AuditKind) -> usize {
    audit
        .query(&AuditFilter {
            kinds: Some(vec![kind]),
            ..AuditFilter::default()
        })
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn denied_submit_creates_no_task_and_one_deny_event() {
    let fx = fixture(NoopDispatch::new()).await;
    let actor = actor(&fx, TierLevel::Trial).await;

    let err = fx
        .orchestrator
        .submit(SubmitRequest::new(
            actor,
            ActionType::PortalScrape,
            json!({}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::errors::OrchestratorError::Authorization(_)
    ));
    assert_eq!(fx.orchestrator.pending(), 0);
    assert_eq!(audit_count(&fx.audit, AuditKind::DecisionDenied).await, 1);
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskQueued).await, 0);
}

#[tokio::test]
async fn allowed_submit_runs_to_success() {
    let fx = fixture(NoopDispatch::new()).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("concierge", [ActionType::ChatReply], 2))
        .unwrap();
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Standard).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(actor, ActionType::ChatReply, json!({})))
        .await
        .unwrap();
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Succeeded).await;

    let record = fx.orchestrator.task(&task.id).unwrap();
    assert_eq!(record.attempts, 1);
    assert!(record.result.is_some());
    assert!(record.completed_at.is_some());
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskQueued).await, 1);
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskAssigned).await, 1);
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskSucceeded).await, 1);
}

#[tokio::test]
async fn unmatched_task_waits_for_role_registration() {
    let fx = fixture(NoopDispatch::new()).await;
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Enterprise).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(
            actor,
            ActionType::PortalScrape,
            json!({}),
        ))
        .await
        .unwrap();

    // Several scheduling cycles pass; the task is never dropped.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(
        fx.orchestrator.task(&task.id).unwrap().status,
        TaskStatus::Queued
    );

    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("scout", [ActionType::PortalScrape], 1))
        .unwrap();
    fx.orchestrator.wake();
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Succeeded).await;
}

#[tokio::test]
async fn failures_retry_to_the_attempt_limit_then_go_terminal() {
    let fx = fixture(Arc::new(FailingDispatch)).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("concierge", [ActionType::ChatReply], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    // Trial tier allows two attempts.
    let actor = actor(&fx, TierLevel::Trial).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(actor, ActionType::ChatReply, json!({})))
        .await
        .unwrap();
    assert_eq!(task.max_attempts, 2);
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Failed).await;

    let record = fx.orchestrator.task(&task.id).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error.as_deref(), Some("worker exploded"));
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskRetried).await, 1);
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskFailed).await, 1);
}

#[tokio::test]
async fn duplicate_completion_is_a_warned_noop() {
    let fx = fixture(NoopDispatch::new()).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("concierge", [ActionType::ChatReply], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Standard).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(actor, ActionType::ChatReply, json!({})))
        .await
        .unwrap();
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Succeeded).await;
    let first = fx.orchestrator.task(&task.id).unwrap();

    let second = fx
        .orchestrator
        .complete(&task.id, json!({ "late": true }))
        .await
        .unwrap();
    assert_eq!(second.result, first.result);
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskSucceeded).await, 1);
    assert_eq!(
        audit_count(&fx.audit, AuditKind::DuplicateCompletion).await,
        1
    );
}

#[tokio::test]
async fn running_task_cancels_cooperatively() {
    let fx = fixture(Arc::new(SlowDispatch)).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("analyst", [ActionType::DataAnalyze], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Enterprise).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(actor, ActionType::DataAnalyze, json!({})))
        .await
        .unwrap();
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Running).await;

    let status = fx.orchestrator.cancel(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelling);
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Cancelled).await;
    assert_eq!(audit_count(&fx.audit, AuditKind::TaskCancelled).await, 1);
}

#[tokio::test]
async fn queued_task_cancels_immediately() {
    let fx = fixture(NoopDispatch::new()).await;
    // No matching role registered, so the task stays queued.
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Enterprise).await;
    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(
            actor,
            ActionType::PortalScrape,
            json!({}),
        ))
        .await
        .unwrap();

    let status = fx.orchestrator.cancel(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelled);
    assert_eq!(fx.orchestrator.pending(), 0);
}

#[tokio::test]
async fn correlated_tasks_assign_in_submission_order() {
    let fx = fixture(NoopDispatch::new()).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("scribe", [ActionType::DocumentDraft], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Enterprise).await;
    let correlation = CorrelationId::new();

    let mut ids = Vec::new();
    for step in 0..3 {
        let task = fx
            .orchestrator
            .submit(
                SubmitRequest::new(
                    actor.clone(),
                    ActionType::DocumentDraft,
                    json!({ "step": step }),
                )
                .correlated(correlation.clone()),
            )
            .await
            .unwrap();
        ids.push(task.id);
    }

    for id in &ids {
        wait_for_status(&fx.orchestrator, id, TaskStatus::Succeeded).await;
    }

    // Assignment preserved submission order: started_at must be monotonic
    // across the correlation with a single-slot worker.
    let records: Vec<_> = ids
        .iter()
        .map(|id| fx.orchestrator.task(id).unwrap())
        .collect();
    for pair in records.windows(2) {
        assert!(pair[0].started_at.unwrap() <= pair[1].started_at.unwrap());
    }
    let states = fx.orchestrator.correlation_states(&correlation);
    assert_eq!(states.len(), 3);
    assert!(states
        .iter()
        .all(|(_, status)| *status == TaskStatus::Succeeded));
}

#[tokio::test]
async fn memory_outage_degrades_gracefully() {
    let fx = fixture_full(NoopDispatch::new(), Arc::new(FailingMemory), None).await;
    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("concierge", [ActionType::ChatReply], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    let actor = actor(&fx, TierLevel::Standard).await;

    let task = fx
        .orchestrator
        .submit(SubmitRequest::new(actor, ActionType::ChatReply, json!({})))
        .await
        .unwrap();
    wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Succeeded).await;
    assert!(fx.orchestrator.task(&task.id).unwrap().memory_unavailable);
}

#[tokio::test]
async fn restart_recovers_in_flight_tasks_to_queued() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");

    let task_id = {
        let store = Arc::new(StateStore::open(&path).unwrap());
        let fx = fixture_full(Arc::new(SlowDispatch), NoopMemoryService::new(), Some(store)).await;
        fx.orchestrator
            .registry()
            .register(WorkerRoleSpec::new("analyst", [ActionType::DataAnalyze], 1))
            .unwrap();
        fx.orchestrator.spawn().await;
        let actor = actor(&fx, TierLevel::Enterprise).await;
        let task = fx
            .orchestrator
            .submit(SubmitRequest::new(actor, ActionType::DataAnalyze, json!({})))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &task.id, TaskStatus::Running).await;
        fx.orchestrator.shutdown().await;
        task.id
    };

    let store = Arc::new(StateStore::open(&path).unwrap());
    let fx = fixture_full(NoopDispatch::new(), NoopMemoryService::new(), Some(store)).await;
    let requeued = fx.orchestrator.recover().unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(
        fx.orchestrator.task(&task_id).unwrap().status,
        TaskStatus::Queued
    );

    fx.orchestrator
        .registry()
        .register(WorkerRoleSpec::new("analyst", [ActionType::DataAnalyze], 1))
        .unwrap();
    fx.orchestrator.spawn().await;
    wait_for_status(&fx.orchestrator, &task_id, TaskStatus::Succeeded).await;
}
