use gatehouse_core_types::{ActorId, GateError};
use gatehouse_policy_center::PolicyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),
    #[error("actor revoked: {0}")]
    ActorRevoked(ActorId),
    #[error("requested scope exceeds origin scope")]
    ScopeExceedsOrigin,
    #[error("delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded { depth: u8, max: u8 },
    #[error("agent identities require a ttl")]
    TtlRequired,
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("state store error: {0}")]
    Store(String),
}

impl From<IdentityError> for GateError {
    fn from(value: IdentityError) -> Self {
        GateError::new(value.to_string())
    }
}
