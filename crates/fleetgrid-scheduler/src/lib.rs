//! fleetgrid-scheduler — groups, their roles, and the manager loop.
//!
//! # Architecture
//!
//! ```text
//! GroupManager (periodic, tokio)
//!   ├── GroupPlanManager (target plans, from fleetgrid-state)
//!   ├── WorkerPool (bounded fan-out of per-group work)
//!   └── Group per plan
//!       ├── SchedulerRegistry → GroupScheduler (holds, max counts)
//!       ├── Role per plan role (via RoleFactory)
//!       └── DiffWriter → groups/{id}
//! ```
//!
//! Roles are the seam to whatever runs instances. [`SimRole`] is the
//! in-tree implementation: instances are bookkeeping entries on allocator
//! slots, which is enough to run the daemon standalone.

pub mod audit;
pub mod error;
pub mod group;
pub mod manager;
pub mod pool;
pub mod role;
pub mod sim;

#[cfg(test)]
mod testing;

pub use audit::{AuditEvent, AuditSink, TracingAudit};
pub use error::{GroupError, GroupResult, ManagerError, ManagerResult};
pub use group::{Group, GroupContext, GroupSnapshot, group_key};
#[cfg(debug_assertions)]
pub use manager::OperatorCommand;
pub use manager::{CycleReport, GroupManager, ManagerConfig};
pub use pool::WorkerPool;
pub use role::{Role, RoleContext, RoleFactory};
pub use sim::{SimRole, SimRoleFactory};
