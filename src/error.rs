use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("concurrent update on {entity} {key}, retry the operation")]
    ConcurrencyConflict { entity: &'static str, key: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(StoreError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { entity, key } => Self::ConcurrencyConflict { entity, key },
            StoreError::Duplicate { entity, key } => {
                Self::Configuration(format!("{entity} {key} already exists"))
            }
            other => Self::Storage(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
