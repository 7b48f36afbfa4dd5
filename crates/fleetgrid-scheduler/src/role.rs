//! The per-role instance manager contract.
//!
//! A `Role` owns the live instances of one role of one group. The group
//! pushes plans and schedule parameters into it during reconciliation and
//! calls `execute` only after the group state has been persisted, so every
//! method except `execute` and `release_slot` must be free of external side
//! effects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_core::{GroupId, ReleasePreference, RoleId, RolePlan, RoleStatus, SlotId, Version};
use fleetgrid_placement::ResourceAllocator;
use fleetgrid_rollout::ScheduleParams;
use serde_json::Value;

use crate::error::GroupResult;

/// Handles a role is constructed with.
#[derive(Clone)]
pub struct RoleContext {
    pub group_id: GroupId,
    pub role_id: RoleId,
    pub allocator: Arc<dyn ResourceAllocator>,
}

impl RoleContext {
    /// Allocator tag for this role's slots.
    pub fn resource_tag(&self) -> String {
        format!("{}.{}", self.group_id, self.role_id)
    }
}

pub trait Role: Send + Sync {
    fn debug_id(&self) -> String;

    fn set_plan(&mut self, plan: &RolePlan, version: &str);
    /// Drain toward zero instances; the role is leaving the group.
    fn set_empty_plan(&mut self);
    fn stop(&mut self);
    fn is_stopped(&self) -> bool;

    /// Availability per version, as a percentage of the version's base count.
    fn availability(&self) -> BTreeMap<Version, u32>;
    /// Base count of a version, or `None` if unknown.
    fn base_count(&self, version: &str) -> Option<u32>;
    fn version_counts(&self) -> BTreeMap<Version, u32>;
    fn remove_version(&mut self, version: &str);

    fn set_schedule_params(&mut self, params: ScheduleParams);
    /// Act on the last plan and parameters.
    fn execute(&mut self);

    fn resource_tags(&self) -> BTreeSet<String>;
    fn fill_status(&self, status: &mut RoleStatus);
    /// Returns false if the slot does not belong to this role.
    fn release_slot(&mut self, slot: &SlotId, preference: ReleasePreference) -> bool;
    fn recover_services(&mut self);

    /// Persistable state of the role.
    fn snapshot(&self) -> Value;
    fn clone_box(&self) -> Box<dyn Role>;
}

/// Builds roles for groups.
pub trait RoleFactory: Send + Sync {
    fn create(&self, ctx: RoleContext) -> Box<dyn Role>;
    fn restore(&self, ctx: RoleContext, snapshot: Value) -> GroupResult<Box<dyn Role>>;
}
