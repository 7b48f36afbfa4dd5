//! fleetgrid rollout math — how many instances of each version stay alive.
//!
//! Every cycle a group asks its scheduler for per-role [`ScheduleParams`].
//! The default scheduler runs the [`HoldMatrix`] over the roles'
//! per-version availability so a rolling upgrade never drops a role below
//! its minimum health count, while spare capacity goes to the latest
//! version first.
//!
//! # Components
//!
//! - **`hold_matrix`** — role × version hold computation
//! - **`group_scheduler`** — scheduler trait, default scheduler, registry by name
//! - **`params`** — per-role scheduling parameters

pub mod error;
pub mod group_scheduler;
pub mod hold_matrix;
pub mod params;

pub use error::{RolloutError, RolloutResult};
pub use group_scheduler::{
    DEFAULT_SCHEDULER, DefaultGroupScheduler, GroupScheduler, RoleSnapshot, SchedulerRegistry,
};
pub use hold_matrix::{HoldMatrix, HoldTable};
pub use params::ScheduleParams;
