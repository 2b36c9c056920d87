use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StateStoreError> for gatehouse_core_types::GateError {
    fn from(value: StateStoreError) -> Self {
        gatehouse_core_types::GateError::new(value.to_string())
    }
}
