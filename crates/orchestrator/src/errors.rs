use thiserror::Error;

use gatehouse_core_types::{GateError, TaskId};
use gatehouse_evaluator::EvalError;

use crate::model::TaskStatus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The permission evaluator denied the submission; no task was created.
    #[error(transparent)]
    Authorization(#[from] EvalError),
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("invalid task transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("internal orchestrator error: {0}")]
    Internal(String),
}

impl From<OrchestratorError> for GateError {
    fn from(value: OrchestratorError) -> Self {
        GateError::new(value.to_string())
    }
}
