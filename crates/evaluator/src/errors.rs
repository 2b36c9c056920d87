use std::time::Duration;

use thiserror::Error;

use gatehouse_core_types::{ActionType, ActorId, GateError, TenantId, TierLevel};

/// Caller-facing denial taxonomy. Authorization errors are never retried
/// automatically; only `RateLimitExceeded` is retry-safe, after the
/// carried interval.
#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),
    #[error("actor revoked: {0}")]
    ActorRevoked(ActorId),
    #[error("tenant suspended: {0}")]
    TenantSuspended(TenantId),
    #[error("action {action} not permitted for tier {tier}")]
    ActionNotPermitted {
        action: ActionType,
        tier: TierLevel,
    },
    #[error("action {action} outside delegated scope")]
    ScopeExceeded { action: ActionType },
    #[error("rate limit exceeded; retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },
    #[error("infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),
}

impl EvalError {
    /// Quota errors are the only ones safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvalError::RateLimitExceeded { .. })
    }
}

impl From<EvalError> for GateError {
    fn from(value: EvalError) -> Self {
        GateError::new(value.to_string())
    }
}
