//! Error types for the allocation layer.

use fleet_core::ErrorCode;
use fleetgrid_state::StateError;
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("allocator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid buffer config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PlacementError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlacementError::Unavailable(_) => ErrorCode::AllocatorUnavailable,
            PlacementError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            PlacementError::State(e) => e.code(),
        }
    }
}
