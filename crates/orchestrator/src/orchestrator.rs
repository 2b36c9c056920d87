use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use gatehouse_audit_center::{AuditEvent, AuditKind, AuditSink};
use gatehouse_core_types::{Clock, RoleId, TaskId};
use gatehouse_evaluator::{EvalContext, PermissionEvaluator};
use gatehouse_event_bus::{EventBus, InMemoryBus};
use gatehouse_policy_center::PolicyCenter;
use gatehouse_state_store::{RecordKind, StateStore};
use gatehouse_worker_registry::{LoadPermit, WorkerRegistry};

use crate::dispatch::WorkerDispatch;
use crate::errors::OrchestratorError;
use crate::memory::MemoryService;
use crate::metrics;
use crate::model::{MemoryAttachment, SubmitRequest, TaskEvent, TaskRecord, TaskStatus, WorkAssignment};
use crate::runtime::OrchestratorRuntime;

struct Shared<D>
where
    D: WorkerDispatch + 'static,
{
    runtime: Arc<OrchestratorRuntime>,
    registry: Arc<WorkerRegistry>,
    evaluator: Arc<PermissionEvaluator>,
    policy: Arc<dyn PolicyCenter>,
    dispatch: Arc<D>,
    memory: Arc<dyn MemoryService>,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<StateStore>>,
    bus: Arc<InMemoryBus<TaskEvent>>,
    clock: Arc<dyn Clock>,
}

/// The task queue and scheduling loop. `submit` authorizes synchronously
/// through the permission evaluator and enqueues on allow; execution is
/// asynchronous and callers observe completion through task status or the
/// event bus, never as exceptions across the async boundary.
pub struct Orchestrator<D>
where
    D: WorkerDispatch + 'static,
{
    shared: Arc<Shared<D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D> Orchestrator<D>
where
    D: WorkerDispatch + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<OrchestratorRuntime>,
        registry: Arc<WorkerRegistry>,
        evaluator: Arc<PermissionEvaluator>,
        policy: Arc<dyn PolicyCenter>,
        dispatch: Arc<D>,
        memory: Arc<dyn MemoryService>,
        audit: Arc<dyn AuditSink>,
        store: Option<Arc<StateStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                registry,
                evaluator,
                policy,
                dispatch,
                memory,
                audit,
                store,
                bus: InMemoryBus::new(256),
                clock,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the scheduling loop; idempotent.
    pub async fn spawn(&self) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                assign_pass(&shared).await;
                tokio::select! {
                    _ = shared.runtime.notify.notified() => {}
                    _ = sleep(shared.runtime.config.tick) => {}
                }
            }
        });
        *guard = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }

    /// Authorize and enqueue one unit of work. A denial surfaces the
    /// evaluator's error verbatim and creates no task.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskRecord, OrchestratorError> {
        let shared = &self.shared;
        let ctx = EvalContext {
            resource: request.resource.clone(),
        };
        let decision = match shared
            .evaluator
            .evaluate_strict(&request.actor_id, request.action, &ctx)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                metrics::record_denied();
                return Err(err.into());
            }
        };

        let tenant_id = decision
            .tenant_id
            .clone()
            .ok_or_else(|| OrchestratorError::Internal("allow decision missing tenant".into()))?;
        let tier = decision
            .tier
            .ok_or_else(|| OrchestratorError::Internal("allow decision missing tier".into()))?;
        let resolution = shared
            .policy
            .resolve(&tenant_id, tier)
            .await
            .map_err(|err| OrchestratorError::Internal(err.to_string()))?;

        let now = shared.clock.now();
        let record = TaskRecord {
            id: TaskId::new(),
            tenant_id,
            actor_id: request.actor_id,
            action: request.action,
            payload: request.payload,
            resource: request.resource,
            correlation_id: request.correlation.unwrap_or_default(),
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: resolution.tier.max_attempts as u32,
            timeout_ms: resolution.tier.task_timeout_ms,
            assigned_role: None,
            memory_unavailable: false,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        metrics::record_submitted();
        persist(shared, &record);
        emit(
            shared,
            AuditKind::TaskQueued,
            &record,
            json!({ "decision": decision.id.to_string() }),
        )
        .await;
        publish(shared, &record);
        shared.runtime.admit(record.clone());
        Ok(record)
    }

    /// Terminal success reported by the dispatch layer. Idempotent: a
    /// second completion is a no-op logged as a duplicate, never a second
    /// side effect.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        result: Value,
    ) -> Result<TaskRecord, OrchestratorError> {
        let shared = &self.shared;
        let record = shared
            .runtime
            .record(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
        if record.status.is_terminal() {
            note_duplicate(shared, &record, "complete").await;
            return Ok(record);
        }
        finalize_success(shared, task_id, result).await
    }

    /// Worker-reported failure; retried up to the attempt budget, then
    /// terminal. Same idempotency contract as `complete`.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<TaskRecord, OrchestratorError> {
        let shared = &self.shared;
        let record = shared
            .runtime
            .record(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
        if record.status.is_terminal() {
            note_duplicate(shared, &record, "fail").await;
            return Ok(record);
        }
        handle_failure(shared, task_id, error.into(), false).await
    }

    /// Cooperative cancellation. Queued and assigned tasks cancel
    /// immediately; a running task moves to `Cancelling` until its worker
    /// observes the signal and reports back.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskStatus, OrchestratorError> {
        let shared = &self.shared;
        let record = shared
            .runtime
            .record(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
        match record.status {
            TaskStatus::Queued => {
                shared.runtime.lanes.remove(&record.correlation_id, task_id);
                let updated = shared.runtime.transition(
                    task_id,
                    TaskStatus::Cancelled,
                    shared.clock.now(),
                    |record| record.error = Some("cancelled".into()),
                )?;
                metrics::record_cancelled();
                persist(shared, &updated);
                emit(shared, AuditKind::TaskCancelled, &updated, Value::Null).await;
                publish(shared, &updated);
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::Assigned => {
                if let Some(token) = shared.runtime.cancel_token(task_id) {
                    token.cancel();
                }
                let updated = shared.runtime.transition(
                    task_id,
                    TaskStatus::Cancelled,
                    shared.clock.now(),
                    |record| record.error = Some("cancelled".into()),
                )?;
                metrics::record_cancelled();
                persist(shared, &updated);
                emit(shared, AuditKind::TaskCancelled, &updated, Value::Null).await;
                publish(shared, &updated);
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::Running => {
                if let Some(token) = shared.runtime.cancel_token(task_id) {
                    token.cancel();
                }
                let updated = shared.runtime.transition(
                    task_id,
                    TaskStatus::Cancelling,
                    shared.clock.now(),
                    |_| {},
                )?;
                publish(shared, &updated);
                Ok(TaskStatus::Cancelling)
            }
            status => Ok(status),
        }
    }

    /// Re-admit journaled tasks after a restart. Non-terminal tasks are
    /// recovered to `Queued` for at-least-once re-execution; terminal
    /// records stay queryable.
    pub fn recover(&self) -> Result<usize, OrchestratorError> {
        let shared = &self.shared;
        let Some(store) = &shared.store else {
            return Ok(0);
        };
        let records = store
            .replay_kind(RecordKind::Task)
            .map_err(|err| OrchestratorError::Internal(err.to_string()))?;
        let mut latest: HashMap<TaskId, TaskRecord> = HashMap::new();
        let mut order: Vec<TaskId> = Vec::new();
        for record in records {
            match serde_json::from_value::<TaskRecord>(record.payload) {
                Ok(task) => {
                    if !latest.contains_key(&task.id) {
                        order.push(task.id.clone());
                    }
                    latest.insert(task.id.clone(), task);
                }
                Err(err) => warn!(target: "orchestrator", %err, "skipping unreadable task record"),
            }
        }
        let mut requeued = 0;
        for id in order {
            let Some(mut task) = latest.remove(&id) else {
                continue;
            };
            if !task.status.is_terminal() {
                task.status = TaskStatus::Queued;
                task.assigned_role = None;
                requeued += 1;
            }
            shared.runtime.restore(task);
        }
        if requeued > 0 {
            info!(target: "orchestrator", requeued, "recovered in-flight tasks to queued");
        }
        Ok(requeued)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.bus.subscribe()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.shared.runtime.record(task_id)
    }

    pub fn correlation_states(
        &self,
        correlation: &gatehouse_core_types::CorrelationId,
    ) -> Vec<(TaskId, TaskStatus)> {
        self.shared.runtime.correlation_states(correlation)
    }

    pub fn pending(&self) -> usize {
        self.shared.runtime.pending()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Nudge the scheduling loop (worker registration, tests).
    pub fn wake(&self) {
        self.shared.runtime.wake();
    }
}

/// One pass over the lane heads: match capability, claim the least-loaded
/// eligible role, and hand the task to a worker. A head with no capacity
/// keeps its lane blocked (backpressure); the loop retries on the next
/// wake or tick.
async fn assign_pass<D>(shared: &Arc<Shared<D>>)
where
    D: WorkerDispatch + 'static,
{
    for (correlation, task_id) in shared.runtime.lanes.heads() {
        let Some(record) = shared.runtime.record(&task_id) else {
            shared.runtime.lanes.pop_head(&correlation, &task_id);
            continue;
        };
        if record.status != TaskStatus::Queued {
            shared.runtime.lanes.pop_head(&correlation, &task_id);
            continue;
        }

        let mut permit: Option<LoadPermit> = None;
        for candidate in shared.registry.candidates(record.action) {
            if let Some(claimed) = shared.registry.try_acquire(&candidate.id) {
                permit = Some(claimed);
                break;
            }
        }
        let Some(permit) = permit else {
            continue;
        };

        if !shared.runtime.lanes.pop_head(&correlation, &task_id) {
            continue;
        }
        let role: RoleId = permit.role().clone();
        match shared.runtime.transition(
            &task_id,
            TaskStatus::Assigned,
            shared.clock.now(),
            |record| record.assigned_role = Some(role.clone()),
        ) {
            Ok(updated) => {
                metrics::record_assigned();
                persist(shared, &updated);
                emit(
                    shared,
                    AuditKind::TaskAssigned,
                    &updated,
                    json!({ "role": role.to_string() }),
                )
                .await;
                publish(shared, &updated);
                tokio::spawn(run_task(Arc::clone(shared), task_id, permit));
            }
            Err(err) => {
                // Cancelled between the snapshot and the claim; the permit
                // drops here and frees the slot.
                debug!(target: "orchestrator", task = %task_id, %err, "assignment lost to concurrent transition");
            }
        }
    }
}

async fn run_task<D>(shared: Arc<Shared<D>>, task_id: TaskId, permit: LoadPermit)
where
    D: WorkerDispatch + 'static,
{
    let outcome = execute_task(&shared, &task_id).await;
    drop(permit);
    shared.runtime.wake();
    if let Err(err) = outcome {
        debug!(target: "orchestrator", task = %task_id, %err, "task run ended without a transition");
    }
}

async fn execute_task<D>(
    shared: &Arc<Shared<D>>,
    task_id: &TaskId,
) -> Result<(), OrchestratorError>
where
    D: WorkerDispatch + 'static,
{
    let record = shared.runtime.transition(
        task_id,
        TaskStatus::Running,
        shared.clock.now(),
        |record| record.attempts += 1,
    )?;
    persist(shared, &record);
    publish(shared, &record);

    // Attach compound memory context; degrade gracefully on failure.
    let context_text = format!("{} {}", record.action, record.payload);
    let memory = match shared
        .memory
        .query(
            &record.actor_id,
            &context_text,
            shared.runtime.config.memory_top_k,
        )
        .await
    {
        Ok(snippets) => MemoryAttachment {
            snippets,
            unavailable: false,
        },
        Err(err) => {
            warn!(target: "orchestrator", task = %task_id, %err, "memory service unavailable; dispatching without context");
            MemoryAttachment {
                snippets: Vec::new(),
                unavailable: true,
            }
        }
    };
    let record = if memory.unavailable {
        shared
            .runtime
            .annotate(task_id, |record| record.memory_unavailable = true)
            .unwrap_or(record)
    } else {
        record
    };

    let Some(role) = record.assigned_role.clone() else {
        return Err(OrchestratorError::Internal(
            "running task has no assigned role".into(),
        ));
    };
    let cancel = shared
        .runtime
        .cancel_token(task_id)
        .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;
    let assignment = WorkAssignment {
        task: record.clone(),
        role,
        memory,
    };

    let deadline = Duration::from_millis(record.timeout_ms.max(1));
    match timeout(deadline, shared.dispatch.execute(assignment, cancel.clone())).await {
        Ok(Ok(result)) => {
            finalize_success(shared, task_id, result).await?;
        }
        Ok(Err(err)) => {
            if cancel.is_cancelled() {
                finalize_cancelled(shared, task_id, err.to_string()).await?;
            } else {
                handle_failure(shared, task_id, err.to_string(), false).await?;
            }
        }
        Err(_) => {
            metrics::record_timed_out();
            // Signal the worker even though the attempt is already charged.
            cancel.cancel();
            handle_failure(
                shared,
                task_id,
                format!("task timed out after {}ms", record.timeout_ms),
                true,
            )
            .await?;
        }
    }
    Ok(())
}

async fn finalize_success<D>(
    shared: &Arc<Shared<D>>,
    task_id: &TaskId,
    result: Value,
) -> Result<TaskRecord, OrchestratorError>
where
    D: WorkerDispatch + 'static,
{
    let updated = shared.runtime.transition(
        task_id,
        TaskStatus::Succeeded,
        shared.clock.now(),
        |record| {
            record.result = Some(result);
            record.error = None;
        },
    )?;
    metrics::record_succeeded();
    persist(shared, &updated);
    emit(
        shared,
        AuditKind::TaskSucceeded,
        &updated,
        json!({ "attempts": updated.attempts }),
    )
    .await;
    publish(shared, &updated);
    Ok(updated)
}

async fn finalize_cancelled<D>(
    shared: &Arc<Shared<D>>,
    task_id: &TaskId,
    detail: String,
) -> Result<TaskRecord, OrchestratorError>
where
    D: WorkerDispatch + 'static,
{
    let updated = shared.runtime.transition(
        task_id,
        TaskStatus::Cancelled,
        shared.clock.now(),
        |record| record.error = Some(detail.clone()),
    )?;
    metrics::record_cancelled();
    persist(shared, &updated);
    emit(
        shared,
        AuditKind::TaskCancelled,
        &updated,
        json!({ "detail": detail }),
    )
    .await;
    publish(shared, &updated);
    Ok(updated)
}

async fn handle_failure<D>(
    shared: &Arc<Shared<D>>,
    task_id: &TaskId,
    error: String,
    timed_out: bool,
) -> Result<TaskRecord, OrchestratorError>
where
    D: WorkerDispatch + 'static,
{
    let record = shared
        .runtime
        .record(task_id)
        .ok_or_else(|| OrchestratorError::UnknownTask(task_id.clone()))?;

    // A failure that raced a cancellation request finalizes as cancelled.
    if record.status == TaskStatus::Cancelling {
        return finalize_cancelled(shared, task_id, error).await;
    }

    if record.attempts < record.max_attempts {
        let updated = shared.runtime.transition(
            task_id,
            TaskStatus::Queued,
            shared.clock.now(),
            |record| {
                record.error = Some(error.clone());
                record.assigned_role = None;
            },
        )?;
        metrics::record_retried();
        shared.runtime.reset_cancel(task_id);
        persist(shared, &updated);
        emit(
            shared,
            AuditKind::TaskRetried,
            &updated,
            json!({ "attempt": updated.attempts, "error": error, "timed_out": timed_out }),
        )
        .await;
        publish(shared, &updated);

        let shared = Arc::clone(shared);
        let correlation = updated.correlation_id.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            sleep(shared.runtime.config.retry_backoff).await;
            // Front of the lane: a retry keeps its submission-order slot.
            shared.runtime.lanes.push_front(correlation, task_id);
            shared.runtime.wake();
        });
        Ok(updated)
    } else {
        let updated = shared.runtime.transition(
            task_id,
            TaskStatus::Failed,
            shared.clock.now(),
            |record| record.error = Some(error.clone()),
        )?;
        metrics::record_failed();
        persist(shared, &updated);
        emit(
            shared,
            AuditKind::TaskFailed,
            &updated,
            json!({ "attempts": updated.attempts, "error": error, "timed_out": timed_out }),
        )
        .await;
        publish(shared, &updated);
        Ok(updated)
    }
}

async fn note_duplicate<D>(shared: &Arc<Shared<D>>, record: &TaskRecord, operation: &str)
where
    D: WorkerDispatch + 'static,
{
    metrics::record_duplicate_completion();
    warn!(
        target: "orchestrator",
        task = %record.id,
        status = ?record.status,
        operation,
        "duplicate completion ignored"
    );
    emit(
        shared,
        AuditKind::DuplicateCompletion,
        record,
        json!({ "operation": operation, "status": record.status }),
    )
    .await;
}

fn persist<D>(shared: &Shared<D>, record: &TaskRecord)
where
    D: WorkerDispatch + 'static,
{
    if let Some(store) = &shared.store {
        if let Err(err) = store.append(RecordKind::Task, record) {
            warn!(target: "orchestrator", task = %record.id, %err, "task journal append failed");
        }
    }
}

async fn emit<D>(shared: &Shared<D>, kind: AuditKind, record: &TaskRecord, detail: Value)
where
    D: WorkerDispatch + 'static,
{
    let event = AuditEvent::new(kind, shared.clock.now())
        .actor(record.actor_id.clone())
        .tenant(record.tenant_id.clone())
        .task(record.id.clone())
        .detail(detail);
    if let Err(err) = shared.audit.append(event).await {
        warn!(target: "orchestrator", task = %record.id, %err, "audit append failed");
    }
}

fn publish<D>(shared: &Shared<D>, record: &TaskRecord)
where
    D: WorkerDispatch + 'static,
{
    shared.bus.publish_lossy(TaskEvent {
        task: record.id.clone(),
        correlation: record.correlation_id.clone(),
        status: record.status,
        attempt: record.attempts,
        at: shared.clock.now(),
    });
}
