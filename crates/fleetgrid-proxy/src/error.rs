//! Router error types.

use fleet_core::ErrorCode;
use fleetgrid_scheduler::ManagerError;
use fleetgrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid router config: {0}")]
    InvalidConfig(String),

    #[error("proxy backend failed: {0}")]
    Proxy(String),

    #[error("no backend accepts group {0}")]
    NoBackend(String),

    #[error("unknown groups: {}", .0.join(", "))]
    UnknownGroups(Vec<String>),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("local backend error: {0}")]
    Local(#[from] ManagerError),
}

impl RouterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            RouterError::Proxy(_) | RouterError::NoBackend(_) => ErrorCode::ProxyFailure,
            RouterError::UnknownGroups(_) => ErrorCode::NotFound,
            RouterError::State(e) => e.code(),
            RouterError::Local(e) => e.code(),
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
