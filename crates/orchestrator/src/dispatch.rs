use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use gatehouse_core_types::GateError;

use crate::backend::{GenerationRequest, ModelBackend};
use crate::model::WorkAssignment;

/// Seam between the orchestrator and the worker fleet. Implementations
/// must observe the cancellation token cooperatively; the orchestrator
/// never terminates a worker forcefully.
#[async_trait]
pub trait WorkerDispatch: Send + Sync {
    async fn execute(
        &self,
        assignment: WorkAssignment,
        cancel: CancellationToken,
    ) -> Result<Value, GateError>;
}

/// Completes instantly; wiring for tests and dry runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDispatch;

impl NoopDispatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl WorkerDispatch for NoopDispatch {
    async fn execute(
        &self,
        assignment: WorkAssignment,
        cancel: CancellationToken,
    ) -> Result<Value, GateError> {
        if cancel.is_cancelled() {
            return Err(GateError::new("cancelled"));
        }
        Ok(json!({ "action": assignment.task.action.as_str(), "ok": true }))
    }
}

/// Dispatch that routes every assignment through a model backend, feeding
/// the attached memory snippets in as context.
pub struct ModelWorkerDispatch {
    backend: Arc<dyn ModelBackend>,
}

impl ModelWorkerDispatch {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl WorkerDispatch for ModelWorkerDispatch {
    async fn execute(
        &self,
        assignment: WorkAssignment,
        cancel: CancellationToken,
    ) -> Result<Value, GateError> {
        let prompt = format!(
            "{}: {}",
            assignment.task.action,
            serde_json::to_string(&assignment.task.payload)
                .unwrap_or_else(|_| "{}".to_string())
        );
        let context = assignment
            .memory
            .snippets
            .iter()
            .map(|snippet| snippet.content.clone())
            .collect();

        let generation = tokio::select! {
            _ = cancel.cancelled() => return Err(GateError::new("cancelled")),
            generation = self.backend.generate(GenerationRequest { prompt, context }) => generation?,
        };
        Ok(json!({
            "content": generation.content,
            "usage": {
                "prompt_tokens": generation.prompt_tokens,
                "completion_tokens": generation.completion_tokens,
            },
            "memory_unavailable": assignment.memory.unavailable,
        }))
    }
}
