use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

impl From<AuditError> for gatehouse_core_types::GateError {
    fn from(value: AuditError) -> Self {
        gatehouse_core_types::GateError::new(value.to_string())
    }
}
