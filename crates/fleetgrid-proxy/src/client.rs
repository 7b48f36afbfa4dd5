//! The two backends a [`Router`](crate::Router) talks to.

use std::collections::BTreeMap;

use fleet_core::{GroupId, GroupPlan, GroupStatus, ReleasePreference, SlotId};
use fleetgrid_scheduler::{GroupManager, ManagerResult};

use crate::error::RouterResult;

/// A remote scheduler that receives the proxied share of each plan.
pub trait ProxyClient: Send + Sync {
    fn add_group(&self, plan: &GroupPlan) -> RouterResult<()>;
    fn update_group(&self, plan: &GroupPlan) -> RouterResult<()>;
    fn delete_group(&self, group_id: &str) -> RouterResult<()>;
    fn set_groups(&self, plans: &BTreeMap<GroupId, GroupPlan>) -> RouterResult<()>;
    /// Statuses of the requested groups the proxy knows about.
    fn group_status(&self, ids: &[GroupId]) -> RouterResult<Vec<GroupStatus>>;
    /// Give slots back to the proxy's cluster.
    fn reclaim_nodes(&self, slots: &[SlotId], preference: ReleasePreference) -> RouterResult<()>;
}

/// Status and slot-release surface of the local scheduler.
pub trait LocalBackend: Send + Sync {
    fn group_status(&self, ids: &[GroupId]) -> ManagerResult<Vec<GroupStatus>>;
    fn release_slots(&self, slots: &[SlotId], preference: ReleasePreference) -> ManagerResult<()>;
}

impl LocalBackend for GroupManager {
    fn group_status(&self, ids: &[GroupId]) -> ManagerResult<Vec<GroupStatus>> {
        GroupManager::group_status(self, ids)
    }

    fn release_slots(&self, slots: &[SlotId], preference: ReleasePreference) -> ManagerResult<()> {
        GroupManager::release_slots(self, slots, preference)
    }
}
