use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatehouse_core_types::{ActionType, ActorId, DecisionId, ReasonCode, TenantId, TierLevel};

use crate::errors::EvalError;

/// Caller-supplied context for one evaluation. The tenant comes from the
/// actor and the time from the engine clock; the resource is the only
/// caller-provided axis.
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
    pub resource: Option<String>,
}

/// Outcome of one evaluation. Ephemeral: it lives in the audit log and in
/// the caller's hands, never in engine state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub id: DecisionId,
    pub actor_id: ActorId,
    pub tenant_id: Option<TenantId>,
    pub action: ActionType,
    pub resource: Option<String>,
    pub reason: ReasonCode,
    pub tier: Option<TierLevel>,
    pub tier_version: Option<u64>,
    pub policy_rev: Option<u64>,
    /// True when the decision was served from a last-known-good policy
    /// cache while the durable store was unreachable.
    pub stale: bool,
    pub remaining_window: Option<u32>,
    pub remaining_burst: Option<u32>,
    #[serde(default, with = "optional_duration_secs")]
    pub retry_after: Option<Duration>,
    pub decided_at: DateTime<Utc>,
}

impl PermissionDecision {
    pub fn allowed(&self) -> bool {
        self.reason.is_allow()
    }

    /// Convert a denial into its taxonomy error; `Ok` for allows.
    pub fn ensure_allowed(self) -> Result<PermissionDecision, EvalError> {
        match self.as_error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    pub fn as_error(&self) -> Option<EvalError> {
        match self.reason {
            ReasonCode::Allowed => None,
            ReasonCode::UnknownActor => Some(EvalError::UnknownActor(self.actor_id.clone())),
            ReasonCode::ActorRevoked => Some(EvalError::ActorRevoked(self.actor_id.clone())),
            ReasonCode::TenantSuspended => Some(EvalError::TenantSuspended(
                self.tenant_id.clone().unwrap_or_else(TenantId::new),
            )),
            ReasonCode::ActionNotPermitted => Some(EvalError::ActionNotPermitted {
                action: self.action,
                tier: self.tier.unwrap_or(TierLevel::Trial),
            }),
            ReasonCode::ScopeExceeded => Some(EvalError::ScopeExceeded {
                action: self.action,
            }),
            ReasonCode::RateLimitExceeded => Some(EvalError::RateLimitExceeded {
                retry_after: self.retry_after.unwrap_or(Duration::from_secs(1)),
            }),
            ReasonCode::InfrastructureUnavailable => Some(EvalError::InfrastructureUnavailable(
                "policy or audit path unavailable".into(),
            )),
        }
    }
}

mod optional_duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
