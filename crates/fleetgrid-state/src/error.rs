//! Error types for the fleetgrid state store.

use fleet_core::ErrorCode;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::Serialize(_) | StateError::Deserialize(_) => ErrorCode::Serialization,
            StateError::NotFound(_) => ErrorCode::NotFound,
            StateError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            StateError::InvalidPlan(_) => ErrorCode::InvalidConfig,
            _ => ErrorCode::Persistence,
        }
    }
}
