//! Scheduler error types.

use fleet_core::ErrorCode;
use fleetgrid_placement::PlacementError;
use fleetgrid_rollout::RolloutError;
use fleetgrid_state::StateError;
use thiserror::Error;

/// Errors from a single group's reconciliation.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("scheduler error: {0}")]
    Rollout(#[from] RolloutError),

    #[error("failed to persist group {group}: {source}")]
    Persist {
        group: String,
        #[source]
        source: StateError,
    },

    #[error("failed to restore role {role}: {reason}")]
    Restore { role: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl GroupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GroupError::Rollout(e) => e.code(),
            GroupError::Persist { .. } => ErrorCode::Persistence,
            GroupError::Restore { .. } => ErrorCode::Serialization,
            GroupError::State(e) => e.code(),
        }
    }
}

pub type GroupResult<T> = Result<T, GroupError>;

/// Errors surfaced by the group manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unresolved slots: {}", .0.join(", "))]
    UnresolvedSlots(Vec<String>),

    #[error("unknown groups: {}", .0.join(", "))]
    UnknownGroups(Vec<String>),

    #[error("group error: {0}")]
    Group(#[from] GroupError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("allocator error: {0}")]
    Placement(#[from] PlacementError),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::UnresolvedSlots(_) => ErrorCode::Unresolved,
            ManagerError::UnknownGroups(_) => ErrorCode::NotFound,
            ManagerError::Group(e) => e.code(),
            ManagerError::State(e) => e.code(),
            ManagerError::Placement(e) => e.code(),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
