//! Error types for scheduler selection.

use fleet_core::ErrorCode;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),

    #[error("scheduler {name} already registered")]
    DuplicateScheduler { name: String },
}

impl RolloutError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RolloutError::UnknownScheduler(_) => ErrorCode::UnknownScheduler,
            RolloutError::DuplicateScheduler { .. } => ErrorCode::InvalidConfig,
        }
    }
}
