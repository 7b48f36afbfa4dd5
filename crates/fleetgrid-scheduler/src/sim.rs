//! SimRole — a role whose instances are bookkeeping entries on slots.
//!
//! An instance becomes ready one `execute` after it is placed. That is
//! enough to drive real rollouts through the scheduler and allocator in
//! standalone mode and in tests without launching processes.

use std::collections::{BTreeMap, BTreeSet};

use fleet_core::{
    InstanceStatus, ReleasePreference, ResourceRequest, RolePlan, RoleStatus, SlotId, SlotInfo,
    Version,
};
use fleetgrid_rollout::ScheduleParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GroupError, GroupResult};
use crate::role::{Role, RoleContext, RoleFactory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimInstance {
    slot: SlotId,
    version: Version,
    ready: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimState {
    plan: Option<RolePlan>,
    latest: Version,
    #[serde(default)]
    stopping: bool,
    #[serde(default)]
    instances: Vec<SimInstance>,
}

#[derive(Clone)]
pub struct SimRole {
    ctx: RoleContext,
    tag: String,
    state: SimState,
    params: Option<ScheduleParams>,
}

impl SimRole {
    pub fn new(ctx: RoleContext) -> Self {
        let tag = ctx.resource_tag();
        Self {
            ctx,
            tag,
            state: SimState::default(),
            params: None,
        }
    }

    fn target(&self) -> u32 {
        if self.state.stopping {
            return 0;
        }
        self.state.plan.as_ref().map_or(0, |p| p.count)
    }

    fn count_of(&self, version: &str) -> u32 {
        self.state
            .instances
            .iter()
            .filter(|i| i.version == version)
            .count() as u32
    }

    fn ready_of(&self, version: &str) -> u32 {
        self.state
            .instances
            .iter()
            .filter(|i| i.version == version && i.ready)
            .count() as u32
    }

    /// Drop instances whose slot is gone or given up on.
    fn drop_lost_instances(&mut self, live: &BTreeMap<SlotId, SlotInfo>) {
        let allocator = self.ctx.allocator.clone();
        self.state.instances.retain(|instance| match live.get(&instance.slot) {
            Some(info) if info.unrecoverable => {
                warn!(tag = %self.tag, slot = %instance.slot, "instance lost on unrecoverable slot");
                allocator.release_slot(&instance.slot, ReleasePreference::hard());
                false
            }
            Some(_) => true,
            None => {
                warn!(tag = %self.tag, slot = %instance.slot, "instance slot vanished");
                false
            }
        });
    }

    /// Keep old versions up to their holds; the rest become latest or go.
    fn retire_old_versions(&mut self, params: &ScheduleParams, target: u32) {
        let latest = self.state.latest.clone();
        let mut latest_count = self.count_of(&latest);
        let mut kept: BTreeMap<Version, u32> = BTreeMap::new();

        // Ready instances are kept ahead of starting ones.
        self.state.instances.sort_by_key(|i| !i.ready);
        let mut next = Vec::with_capacity(self.state.instances.len());
        for mut instance in std::mem::take(&mut self.state.instances) {
            if instance.version == latest {
                next.push(instance);
                continue;
            }
            let hold = params.holds.get(&instance.version).copied().unwrap_or(0);
            let held = kept.entry(instance.version.clone()).or_default();
            if *held < hold {
                *held += 1;
                next.push(instance);
            } else if latest_count < target {
                debug!(tag = %self.tag, slot = %instance.slot, from = %instance.version, to = %latest, "instance upgraded");
                instance.version = latest.clone();
                instance.ready = false;
                latest_count += 1;
                next.push(instance);
            }
        }
        self.state.instances = next;
    }

    /// Keep at most `target` latest instances, dropping starting ones first.
    fn trim_latest(&mut self, target: u32) {
        let latest = self.state.latest.clone();
        let mut excess = self.count_of(&latest).saturating_sub(target);
        if excess == 0 {
            return;
        }
        self.state.instances.sort_by_key(|i| i.ready);
        self.state.instances.retain(|i| {
            if excess > 0 && i.version == latest {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

impl Role for SimRole {
    fn debug_id(&self) -> String {
        self.tag.clone()
    }

    fn set_plan(&mut self, plan: &RolePlan, version: &str) {
        self.state.plan = Some(plan.clone());
        self.state.latest = version.to_string();
        self.state.stopping = false;
    }

    fn set_empty_plan(&mut self) {
        if let Some(plan) = self.state.plan.as_mut() {
            plan.count = 0;
        }
        self.state.stopping = true;
    }

    fn stop(&mut self) {
        self.state.stopping = true;
    }

    fn is_stopped(&self) -> bool {
        self.target() == 0 && self.state.instances.is_empty()
    }

    fn availability(&self) -> BTreeMap<Version, u32> {
        let target = self.target();
        let mut versions: BTreeSet<&Version> =
            self.state.instances.iter().map(|i| &i.version).collect();
        versions.insert(&self.state.latest);
        versions
            .into_iter()
            .map(|v| {
                let pct = match target {
                    0 => 0,
                    t => (self.ready_of(v) * 100 / t).min(100),
                };
                (v.clone(), pct)
            })
            .collect()
    }

    fn base_count(&self, version: &str) -> Option<u32> {
        (version == self.state.latest).then(|| self.target())
    }

    fn version_counts(&self) -> BTreeMap<Version, u32> {
        let mut counts = BTreeMap::new();
        for instance in &self.state.instances {
            *counts.entry(instance.version.clone()).or_default() += 1;
        }
        counts
    }

    fn remove_version(&mut self, version: &str) {
        self.state.instances.retain(|i| i.version != version);
    }

    fn set_schedule_params(&mut self, params: ScheduleParams) {
        self.params = Some(params);
    }

    fn execute(&mut self) {
        let live: BTreeMap<SlotId, SlotInfo> = self
            .ctx
            .allocator
            .slots(&self.tag)
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        self.drop_lost_instances(&live);
        for instance in &mut self.state.instances {
            instance.ready = true;
        }

        let Some(params) = self.params.clone() else {
            return;
        };
        let target = self.target();
        self.retire_old_versions(&params, target);
        self.trim_latest(target);

        let used: BTreeSet<SlotId> = self.state.instances.iter().map(|i| i.slot.clone()).collect();
        let (broken, healthy): (Vec<&SlotInfo>, Vec<&SlotInfo>) = live
            .values()
            .filter(|s| !used.contains(&s.id))
            .partition(|s| s.unrecoverable);
        for slot in &broken {
            self.ctx.allocator.release_slot(&slot.id, ReleasePreference::hard());
        }

        let mut free = healthy.into_iter();
        let mut placed = 0;
        let latest = self.state.latest.clone();
        while (self.state.instances.len() as u32) < params.max_count && self.count_of(&latest) < target {
            let Some(slot) = free.next() else { break };
            self.state.instances.push(SimInstance {
                slot: slot.id.clone(),
                version: latest.clone(),
                ready: false,
            });
            placed += 1;
        }

        let held_old = self.state.instances.len() as u32 - self.count_of(&latest);
        let request = (held_old + target).min(params.max_count);
        let spare = request.saturating_sub(self.state.instances.len() as u32) as usize;
        let mut released = broken.len();
        for slot in free.skip(spare) {
            self.ctx.allocator.release_slot(&slot.id, ReleasePreference::soft());
            released += 1;
        }
        self.ctx
            .allocator
            .update_request(&self.tag, ResourceRequest::count(request));

        if placed > 0 || released > 0 {
            debug!(
                tag = %self.tag,
                placed,
                released,
                request,
                instances = self.state.instances.len(),
                "role executed"
            );
        }
    }

    fn resource_tags(&self) -> BTreeSet<String> {
        if self.target() > 0 || !self.state.instances.is_empty() {
            BTreeSet::from([self.tag.clone()])
        } else {
            BTreeSet::new()
        }
    }

    fn fill_status(&self, status: &mut RoleStatus) {
        let target = self.target();
        let latest = &self.state.latest;
        status.target_count = target;
        status.version_counts = self.version_counts();
        status.ready = self.ready_of(latest) >= target
            && self.state.instances.iter().all(|i| i.ready && i.version == *latest);
        status.stopped = self.is_stopped();
        status.instances = self
            .state
            .instances
            .iter()
            .map(|i| InstanceStatus {
                slot: i.slot.clone(),
                version: i.version.clone(),
                ready: i.ready,
            })
            .collect();
    }

    fn release_slot(&mut self, slot: &SlotId, preference: ReleasePreference) -> bool {
        let before = self.state.instances.len();
        self.state.instances.retain(|i| i.slot != *slot);
        let owned = before != self.state.instances.len()
            || self.ctx.allocator.slots(&self.tag).iter().any(|s| s.id == *slot);
        if owned {
            self.ctx.allocator.release_slot(slot, preference);
            debug!(tag = %self.tag, %slot, ?preference, "slot released on request");
        }
        owned
    }

    fn recover_services(&mut self) {
        for instance in &mut self.state.instances {
            instance.ready = false;
        }
    }

    fn snapshot(&self) -> Value {
        match serde_json::to_value(&self.state) {
            Ok(value) => value,
            Err(e) => {
                warn!(tag = %self.tag, error = %e, "role state not serializable");
                Value::Null
            }
        }
    }

    fn clone_box(&self) -> Box<dyn Role> {
        Box::new(self.clone())
    }
}

/// Builds [`SimRole`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimRoleFactory;

impl RoleFactory for SimRoleFactory {
    fn create(&self, ctx: RoleContext) -> Box<dyn Role> {
        Box::new(SimRole::new(ctx))
    }

    fn restore(&self, ctx: RoleContext, snapshot: Value) -> GroupResult<Box<dyn Role>> {
        let state: SimState = serde_json::from_value(snapshot).map_err(|e| GroupError::Restore {
            role: ctx.role_id.clone(),
            reason: e.to_string(),
        })?;
        let mut role = SimRole::new(ctx);
        role.state = state;
        Ok(Box::new(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_placement::{LocalAllocator, ResourceAllocator};
    use std::sync::Arc;
    use std::time::Duration;

    fn role(alloc: &Arc<LocalAllocator>) -> SimRole {
        SimRole::new(RoleContext {
            group_id: "g1".to_string(),
            role_id: "web".to_string(),
            allocator: alloc.clone(),
        })
    }

    fn allocator() -> Arc<LocalAllocator> {
        let alloc = Arc::new(LocalAllocator::new(2, 4, Duration::from_secs(60)));
        alloc.start();
        alloc
    }

    fn params(max_count: u32, holds: &[(&str, u32)]) -> ScheduleParams {
        ScheduleParams {
            max_count,
            holds: holds.iter().map(|(v, n)| (v.to_string(), *n)).collect(),
            ..ScheduleParams::default()
        }
    }

    /// One role execute followed by one allocator grant.
    fn tick(role: &mut SimRole, alloc: &LocalAllocator) {
        role.execute();
        alloc.after_update().unwrap();
    }

    #[test]
    fn grows_to_target_then_ready() {
        let alloc = allocator();
        let mut role = role(&alloc);
        role.set_plan(&RolePlan::new(3, "/bin/web"), "v1");
        role.set_schedule_params(params(3, &[]));

        tick(&mut role, &alloc);
        assert!(role.state.instances.is_empty(), "no slots before the first grant");
        tick(&mut role, &alloc);
        assert_eq!(role.version_counts()["v1"], 3);
        assert_eq!(role.availability()["v1"], 0);
        tick(&mut role, &alloc);
        assert_eq!(role.availability()["v1"], 100);

        let mut status = RoleStatus::new("web");
        role.fill_status(&mut status);
        assert!(status.ready);
        assert_eq!(status.instances.len(), 3);
    }

    #[test]
    fn old_version_kept_up_to_hold() {
        let alloc = allocator();
        let mut role = role(&alloc);
        role.set_plan(&RolePlan::new(4, "/bin/web"), "v1");
        role.set_schedule_params(params(4, &[]));
        for _ in 0..3 {
            tick(&mut role, &alloc);
        }
        assert_eq!(role.ready_of("v1"), 4);

        role.set_plan(&RolePlan::new(4, "/bin/web"), "v2");
        role.set_schedule_params(params(4, &[("v1", 2)]));
        tick(&mut role, &alloc);
        assert_eq!(role.count_of("v1"), 2);
        assert_eq!(role.count_of("v2"), 2);
        assert_eq!(role.availability()["v2"], 0);
    }

    #[test]
    fn stop_drains_and_releases_everything() {
        let alloc = allocator();
        let mut role = role(&alloc);
        role.set_plan(&RolePlan::new(2, "/bin/web"), "v1");
        role.set_schedule_params(params(2, &[]));
        for _ in 0..2 {
            tick(&mut role, &alloc);
        }
        assert!(!role.is_stopped());

        role.stop();
        role.set_schedule_params(params(0, &[]));
        role.execute();
        assert!(role.is_stopped());
        assert!(role.resource_tags().is_empty());
        assert!(alloc.slots("g1.web").is_empty());
    }

    #[test]
    fn unrecoverable_slot_drops_instance() {
        let alloc = allocator();
        let mut role = role(&alloc);
        role.set_plan(&RolePlan::new(2, "/bin/web"), "v1");
        role.set_schedule_params(params(2, &[]));
        for _ in 0..2 {
            tick(&mut role, &alloc);
        }
        let lost = role.state.instances[0].slot.clone();
        alloc.mark_unrecoverable(&lost);

        role.execute();
        assert!(role.state.instances.iter().all(|i| i.slot != lost));
        assert!(alloc.slots("g1.web").iter().all(|s| s.id != lost));
    }

    #[test]
    fn release_slot_only_for_owned_slots() {
        let alloc = allocator();
        let mut role = role(&alloc);
        role.set_plan(&RolePlan::new(1, "/bin/web"), "v1");
        role.set_schedule_params(params(1, &[]));
        for _ in 0..2 {
            tick(&mut role, &alloc);
        }
        let owned = role.state.instances[0].slot.clone();

        assert!(!role.release_slot(&SlotId::new("elsewhere", 0), ReleasePreference::soft()));
        assert!(role.release_slot(&owned, ReleasePreference::soft()));
        assert!(role.state.instances.is_empty());
    }

    #[test]
    fn restore_from_snapshot() {
        let alloc = allocator();
        let mut original = role(&alloc);
        original.set_plan(&RolePlan::new(1, "/bin/web"), "v1");
        original.set_schedule_params(params(1, &[]));
        for _ in 0..3 {
            tick(&mut original, &alloc);
        }

        let ctx = original.ctx.clone();
        let mut restored = SimRoleFactory.restore(ctx, original.snapshot()).unwrap();
        assert_eq!(restored.version_counts(), original.version_counts());
        restored.recover_services();
        assert_eq!(restored.availability()["v1"], 0);

        let bad = SimRoleFactory.restore(original.ctx.clone(), Value::from(7));
        assert!(matches!(bad, Err(GroupError::Restore { .. })));
    }
}
