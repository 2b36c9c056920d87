use gatehouse_core_types::{GateError, TenantId, TierLevel};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),
    #[error("unknown tier: {0}")]
    UnknownTier(TierLevel),
    #[error("policy store unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported policy path: {0}")]
    UnsupportedPath(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("persist failed: {0}")]
    Persist(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<PolicyError> for GateError {
    fn from(value: PolicyError) -> Self {
        GateError::new(value.to_string())
    }
}
