//! Group — one group's target plan and its live roles.
//!
//! A reconciliation cycle works on a copy of the scheduling state:
//!
//! 1. **update** — create missing roles, push plan and version into each,
//!    mark roles absent from the plan for removal
//! 2. **schedule** — look up the group's scheduler, compute and apply
//!    per-role parameters, drop versions no role still references
//! 3. **prune** — remove roles that are both stopped and marked for removal
//! 4. **persist** — write the whole group as JSON (skipped if unchanged)
//!
//! The copy replaces the live state only after the write succeeds; on
//! failure it is dropped and the live state is untouched. Roles execute
//! after the swap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::{
    GroupId, GroupPhase, GroupStatus, ReleasePreference, RoleId, RoleStatus, SlotId, Version,
    VersionedGroupPlan,
};
use fleetgrid_placement::ResourceAllocator;
use fleetgrid_rollout::{RoleSnapshot, SchedulerRegistry};
use fleetgrid_state::{DiffWriter, Persistence, StateResult, read_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{GroupError, GroupResult};
use crate::role::{Role, RoleContext, RoleFactory};

/// Shared handles every group is built with.
#[derive(Clone)]
pub struct GroupContext {
    pub store: Arc<dyn Persistence>,
    pub allocator: Arc<dyn ResourceAllocator>,
    pub factory: Arc<dyn RoleFactory>,
    pub schedulers: Arc<SchedulerRegistry>,
    pub audit: Arc<dyn AuditSink>,
}

/// Persisted form of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    pub plan: Option<VersionedGroupPlan>,
    pub phase: GroupPhase,
    pub roles: BTreeMap<RoleId, Value>,
    #[serde(default)]
    pub removing: BTreeSet<RoleId>,
}

/// Key under which a group is persisted.
pub fn group_key(group_id: &str) -> String {
    format!("groups/{group_id}")
}

struct GroupState {
    plan: Option<VersionedGroupPlan>,
    phase: GroupPhase,
    roles: BTreeMap<RoleId, Box<dyn Role>>,
    removing: BTreeSet<RoleId>,
}

impl Clone for GroupState {
    fn clone(&self) -> Self {
        Self {
            plan: self.plan.clone(),
            phase: self.phase,
            roles: self
                .roles
                .iter()
                .map(|(id, role)| (id.clone(), role.clone_box()))
                .collect(),
            removing: self.removing.clone(),
        }
    }
}

pub struct Group {
    id: GroupId,
    ctx: GroupContext,
    state: GroupState,
    writer: DiffWriter,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, ctx: GroupContext) -> Self {
        let id = id.into();
        let writer = DiffWriter::new(group_key(&id));
        Self {
            id,
            ctx,
            state: GroupState {
                plan: None,
                phase: GroupPhase::NoPlan,
                roles: BTreeMap::new(),
                removing: BTreeSet::new(),
            },
            writer,
        }
    }

    /// Rebuild a group from its persisted snapshot, if there is one.
    pub fn recover(id: &str, ctx: GroupContext) -> GroupResult<Option<Self>> {
        let key = group_key(id);
        let Some(snapshot) = read_json::<GroupSnapshot>(ctx.store.as_ref(), &key)? else {
            return Ok(None);
        };
        let bytes = DiffWriter::encode(&snapshot)?;

        let mut roles = BTreeMap::new();
        for (role_id, value) in snapshot.roles {
            let role_ctx = RoleContext {
                group_id: id.to_string(),
                role_id: role_id.clone(),
                allocator: ctx.allocator.clone(),
            };
            let mut role = ctx.factory.restore(role_ctx, value)?;
            role.recover_services();
            roles.insert(role_id, role);
        }
        info!(group = id, roles = roles.len(), phase = ?snapshot.phase, "group recovered");

        Ok(Some(Self {
            id: id.to_string(),
            ctx,
            state: GroupState {
                plan: snapshot.plan,
                phase: snapshot.phase,
                roles,
                removing: snapshot.removing,
            },
            writer: DiffWriter::new(key).with_last(bytes),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> GroupPhase {
        self.state.phase
    }

    /// Version of the current target plan, empty without one.
    pub fn version(&self) -> Version {
        self.state
            .plan
            .as_ref()
            .map(|p| p.version.clone())
            .unwrap_or_default()
    }

    pub fn role_ids(&self) -> Vec<RoleId> {
        self.state.roles.keys().cloned().collect()
    }

    /// Adopt a new target plan and become active.
    pub fn set_plan(&mut self, plan: VersionedGroupPlan) {
        let previous = self.version();
        if previous != plan.version {
            self.ctx.audit.record(
                &self.id,
                &AuditEvent::PlanChanged {
                    from: previous,
                    to: plan.version.clone(),
                },
            );
        }
        self.state.phase = GroupPhase::Active;
        self.state.plan = Some(plan);
    }

    /// Zero the plan in place and tell every role to stop.
    pub fn stop(&mut self) {
        if let Some(plan) = self.state.plan.as_mut() {
            plan.plan.zero_out();
        }
        for role in self.state.roles.values_mut() {
            role.stop();
        }
        if self.state.phase != GroupPhase::Stopping {
            info!(group = %self.id, "group stopping");
        }
        self.state.phase = GroupPhase::Stopping;
    }

    /// True once every owned role reports stopped.
    pub fn is_stopped(&self) -> bool {
        self.state.roles.values().all(|r| r.is_stopped())
    }

    /// Run one reconciliation cycle. Returns whether the group was written.
    pub fn reconcile(&mut self) -> GroupResult<bool> {
        let Some(plan) = self.state.plan.clone() else {
            return Ok(false);
        };

        let mut work = self.state.clone();
        self.update_roles(&mut work, &plan);
        self.schedule_roles(&mut work, &plan)?;
        self.prune_roles(&mut work);
        let wrote = self.persist(&work)?;

        self.state = work;
        for role in self.state.roles.values_mut() {
            role.execute();
        }
        Ok(wrote)
    }

    pub fn status(&self) -> GroupStatus {
        let mut status = GroupStatus::new(self.id.clone(), self.version(), self.state.phase);
        for (role_id, role) in &self.state.roles {
            let mut role_status = RoleStatus::new(role_id.clone());
            role.fill_status(&mut role_status);
            status.roles.insert(role_id.clone(), role_status);
        }
        status
    }

    pub fn resource_tags(&self) -> BTreeSet<String> {
        self.state
            .roles
            .values()
            .flat_map(|r| r.resource_tags())
            .collect()
    }

    pub fn release_slot(&mut self, role_id: &str, slot: &SlotId, preference: ReleasePreference) -> bool {
        match self.state.roles.get_mut(role_id) {
            Some(role) => role.release_slot(slot, preference),
            None => false,
        }
    }

    /// Remove the persisted snapshot. Returns whether one existed.
    pub fn delete_persisted(&mut self) -> StateResult<bool> {
        let existed = self.ctx.store.remove(self.writer.key())?;
        self.writer.invalidate();
        Ok(existed)
    }

    // ── Reconciliation steps ─────────────────────────────────────────

    fn update_roles(&self, work: &mut GroupState, plan: &VersionedGroupPlan) {
        for (role_id, role_plan) in &plan.plan.roles {
            work.removing.remove(role_id);
            let role = work.roles.entry(role_id.clone()).or_insert_with(|| {
                debug!(group = %self.id, role = %role_id, "role created");
                self.ctx.factory.create(RoleContext {
                    group_id: self.id.clone(),
                    role_id: role_id.clone(),
                    allocator: self.ctx.allocator.clone(),
                })
            });
            role.set_plan(role_plan, &plan.version);
        }

        for (role_id, role) in work.roles.iter_mut() {
            if plan.plan.roles.contains_key(role_id) {
                continue;
            }
            if work.removing.insert(role_id.clone()) {
                info!(group = %self.id, role = %role_id, "role marked for removal");
            }
            role.set_empty_plan();
        }
    }

    fn schedule_roles(&self, work: &mut GroupState, plan: &VersionedGroupPlan) -> GroupResult<()> {
        let scheduler = self.ctx.schedulers.get(&plan.plan.scheduler.name)?;

        let snapshots: Vec<RoleSnapshot> = work
            .roles
            .iter()
            .map(|(role_id, role)| {
                let availability = role.availability();
                let base_counts = availability
                    .keys()
                    .filter_map(|v| role.base_count(v).map(|b| (v.clone(), b)))
                    .collect();
                RoleSnapshot {
                    role_id: role_id.clone(),
                    target_count: plan.plan.roles.get(role_id).map_or(0, |r| r.count),
                    current_count: role.version_counts().values().sum(),
                    availability,
                    base_counts,
                }
            })
            .collect();

        let params = scheduler.schedule(&plan.plan, &plan.version, &snapshots, epoch_secs());
        for (role_id, role_params) in params {
            if let Some(role) = work.roles.get_mut(&role_id) {
                role.set_schedule_params(role_params);
            }
        }

        let referenced: BTreeSet<Version> = work
            .roles
            .values()
            .flat_map(|r| r.version_counts())
            .filter(|(_, count)| *count > 0)
            .map(|(version, _)| version)
            .chain(std::iter::once(plan.version.clone()))
            .collect();
        for role in work.roles.values_mut() {
            let stale: BTreeSet<Version> = role
                .availability()
                .into_keys()
                .chain(role.version_counts().into_keys())
                .filter(|v| !referenced.contains(v))
                .collect();
            for version in stale {
                debug!(group = %self.id, role = %role.debug_id(), %version, "version dropped");
                role.remove_version(&version);
            }
        }
        Ok(())
    }

    fn prune_roles(&self, work: &mut GroupState) {
        let drained: Vec<RoleId> = work
            .removing
            .iter()
            .filter(|id| work.roles.get(*id).is_none_or(|r| r.is_stopped()))
            .cloned()
            .collect();
        for role_id in drained {
            work.roles.remove(&role_id);
            work.removing.remove(&role_id);
            info!(group = %self.id, role = %role_id, "role removed");
        }
    }

    fn persist(&mut self, work: &GroupState) -> GroupResult<bool> {
        let snapshot = GroupSnapshot {
            group_id: self.id.clone(),
            plan: work.plan.clone(),
            phase: work.phase,
            roles: work
                .roles
                .iter()
                .map(|(id, role)| (id.clone(), role.snapshot()))
                .collect(),
            removing: work.removing.clone(),
        };
        self.writer
            .write(self.ctx.store.as_ref(), &snapshot)
            .map_err(|source| {
                warn!(group = %self.id, error = %source, "group persist failed, keeping previous state");
                GroupError::Persist {
                    group: self.id.clone(),
                    source,
                }
            })
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, FlakyStore, RecordingAudit};
    use fleet_core::{DefaultPlanHasher, GroupPlan, PlanHasher, RolePlan};
    use fleetgrid_placement::LocalAllocator;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        store: Arc<FlakyStore>,
        factory: Arc<FakeFactory>,
        audit: Arc<RecordingAudit>,
        ctx: GroupContext,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(FlakyStore::new());
        let factory = Arc::new(FakeFactory::default());
        let audit = Arc::new(RecordingAudit::default());
        let ctx = GroupContext {
            store: store.clone(),
            allocator: Arc::new(LocalAllocator::new(1, 1, Duration::from_secs(60))),
            factory: factory.clone(),
            schedulers: Arc::new(SchedulerRegistry::with_defaults()),
            audit: audit.clone(),
        };
        Fixture {
            store,
            factory,
            audit,
            ctx,
        }
    }

    fn versioned(plan: GroupPlan) -> VersionedGroupPlan {
        DefaultPlanHasher.stamp(plan)
    }

    fn two_roles() -> GroupPlan {
        GroupPlan::new("g1")
            .with_role("api", RolePlan::new(2, "/bin/api"))
            .with_role("web", RolePlan::new(3, "/bin/web"))
    }

    #[test]
    fn set_plan_audits_only_on_version_change() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        assert_eq!(group.phase(), GroupPhase::NoPlan);

        group.set_plan(versioned(two_roles()));
        group.set_plan(versioned(two_roles()));
        assert_eq!(group.phase(), GroupPhase::Active);
        assert_eq!(fx.audit.plan_changes(), 1);
    }

    #[test]
    fn reconcile_creates_roles_and_executes() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));

        assert!(group.reconcile().unwrap());
        assert_eq!(group.role_ids(), vec!["api".to_string(), "web".to_string()]);
        assert_eq!(fx.factory.executions.load(Ordering::SeqCst), 2);
        assert!(fx.store.inner().exists("groups/g1").unwrap());
    }

    #[test]
    fn unchanged_cycle_skips_write() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));

        // Roles execute after the write, so the second cycle records their progress.
        assert!(group.reconcile().unwrap());
        assert!(group.reconcile().unwrap());
        assert!(!group.reconcile().unwrap());
        assert_eq!(fx.store.writes(), 2);
    }

    #[test]
    fn failed_write_keeps_previous_roles() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));
        group.reconcile().unwrap();
        let before = group.status();
        let executions = fx.factory.executions.load(Ordering::SeqCst);

        let changed = two_roles().with_role("worker", RolePlan::new(1, "/bin/worker"));
        group.set_plan(versioned(changed));
        fx.store.fail.store(true, Ordering::SeqCst);

        let err = group.reconcile().unwrap_err();
        assert!(matches!(err, GroupError::Persist { .. }));
        assert_eq!(group.role_ids(), vec!["api".to_string(), "web".to_string()]);
        assert_eq!(group.status().roles, before.roles);
        assert_eq!(fx.factory.executions.load(Ordering::SeqCst), executions);

        // The same cycle goes through once the store recovers.
        fx.store.fail.store(false, Ordering::SeqCst);
        assert!(group.reconcile().unwrap());
        assert_eq!(group.role_ids().len(), 3);
    }

    #[test]
    fn unknown_scheduler_aborts_cycle() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        let mut plan = two_roles();
        plan.scheduler.name = "nope".to_string();
        group.set_plan(versioned(plan));

        let err = group.reconcile().unwrap_err();
        assert_eq!(err.code(), fleet_core::ErrorCode::UnknownScheduler);
        assert!(group.role_ids().is_empty());
        assert_eq!(fx.store.writes(), 0);
    }

    #[test]
    fn removed_role_drains_then_pruned() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));
        group.reconcile().unwrap();

        let one_role = GroupPlan::new("g1").with_role("api", RolePlan::new(2, "/bin/api"));
        group.set_plan(versioned(one_role));
        // First cycle empties "web"; it stops during execute.
        group.reconcile().unwrap();
        assert_eq!(group.role_ids().len(), 2);
        group.reconcile().unwrap();
        assert_eq!(group.role_ids(), vec!["api".to_string()]);
    }

    #[test]
    fn stop_zeroes_plan_and_reports_stopped() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        let mut plan = two_roles();
        plan.min_health_capacity = 80;
        group.set_plan(versioned(plan));
        group.reconcile().unwrap();
        assert!(!group.is_stopped());

        group.stop();
        assert_eq!(group.phase(), GroupPhase::Stopping);
        group.reconcile().unwrap();
        assert!(group.is_stopped());
        let status = group.status();
        assert!(status.roles.values().all(|r| r.target_count == 0));
    }

    #[test]
    fn recover_restores_roles() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));
        group.reconcile().unwrap();
        let version = group.version();

        let recovered = Group::recover("g1", fx.ctx.clone()).unwrap().unwrap();
        assert_eq!(recovered.version(), version);
        assert_eq!(recovered.phase(), GroupPhase::Active);
        assert_eq!(recovered.role_ids(), group.role_ids());
        assert!(Group::recover("missing", fx.ctx.clone()).unwrap().is_none());
    }

    #[test]
    fn recovered_group_does_not_rewrite_unchanged_state() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));
        group.reconcile().unwrap();
        group.reconcile().unwrap();

        let mut recovered = Group::recover("g1", fx.ctx.clone()).unwrap().unwrap();
        assert!(!recovered.reconcile().unwrap());
        assert_eq!(fx.store.writes(), 2);
    }

    #[test]
    fn delete_persisted_removes_snapshot() {
        let fx = fixture();
        let mut group = Group::new("g1", fx.ctx.clone());
        group.set_plan(versioned(two_roles()));
        group.reconcile().unwrap();

        assert!(group.delete_persisted().unwrap());
        assert!(!fx.store.inner().exists("groups/g1").unwrap());
    }
}
