//! GroupManager — the periodic loop that drives every group.
//!
//! # Cycle
//!
//! ```text
//! statuses (parallel) ─► diff + audit (parallel) ─► swap snapshot
//!     │
//!     └─ allocator down? ─► skip
//!            │
//!            ▼
//!   before_update ─► sync plans ─► stop/remove orphans ─► drain releases
//!            │
//!            ▼
//!   reconcile (parallel) ─► release unreferenced tags ─► after_update
//! ```
//!
//! Per-group work goes through the [`WorkerPool`]. Std locks are never held
//! across an `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use fleet_core::config::ManagerSection;
use fleet_core::{GroupId, GroupPhase, GroupStatus, ReleasePreference, RoleId, SlotId};
use fleetgrid_state::GroupPlanManager;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::audit::AuditEvent;
use crate::error::{GroupResult, ManagerError, ManagerResult};
use crate::group::{Group, GroupContext};
use crate::pool::WorkerPool;

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub interval: Duration,
    pub workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_section(&ManagerSection::default())
    }
}

impl ManagerConfig {
    pub fn from_section(section: &ManagerSection) -> Self {
        Self {
            interval: section.interval(),
            workers: section.workers,
        }
    }
}

/// Runtime controls, available in debug builds only.
#[cfg(debug_assertions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    SetInterval(Duration),
    StopAllocator,
    StartAllocator,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The allocator was down; nothing past the status snapshot ran.
    pub skipped: bool,
    pub status_changes: usize,
    pub reconciled: usize,
    pub persisted: usize,
    pub failed: usize,
    pub removed: Vec<GroupId>,
    pub released_tags: usize,
}

struct PendingRelease {
    group: GroupId,
    role: RoleId,
    slot: SlotId,
    preference: ReleasePreference,
}

type SharedGroup = Arc<Mutex<Group>>;

/// Lock a group even if a panicked job poisoned it. Poisoned groups are
/// replaced by [`GroupManager::reload_group`].
fn lock_group(group: &SharedGroup) -> MutexGuard<'_, Group> {
    group.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GroupManager {
    plans: Arc<GroupPlanManager>,
    ctx: GroupContext,
    groups: RwLock<BTreeMap<GroupId, SharedGroup>>,
    snapshot: RwLock<BTreeMap<GroupId, GroupStatus>>,
    releases: Mutex<Vec<PendingRelease>>,
    pool: WorkerPool,
    interval_ms: AtomicU64,
}

impl GroupManager {
    pub fn new(plans: Arc<GroupPlanManager>, ctx: GroupContext, config: ManagerConfig) -> Self {
        Self {
            plans,
            ctx,
            groups: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(BTreeMap::new()),
            releases: Mutex::new(Vec::new()),
            pool: WorkerPool::new(config.workers),
            interval_ms: AtomicU64::new(config.interval.as_millis() as u64),
        }
    }

    pub fn plans(&self) -> &Arc<GroupPlanManager> {
        &self.plans
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.read().expect("groups lock").keys().cloned().collect()
    }

    /// Rebuild plans, allocator state and groups from persistence.
    /// Returns the number of groups recovered.
    pub fn recover(&self) -> ManagerResult<usize> {
        let plans = self.plans.recover()?;
        self.ctx.allocator.recover()?;

        let mut recovered = BTreeMap::new();
        for key in self.ctx.store.list("groups/")? {
            let Some(id) = key.strip_prefix("groups/") else {
                continue;
            };
            if let Some(group) = Group::recover(id, self.ctx.clone())? {
                recovered.insert(id.to_string(), Arc::new(Mutex::new(group)));
            }
        }
        let count = recovered.len();
        *self.groups.write().expect("groups lock") = recovered;
        info!(plans, groups = count, "group manager recovered");
        Ok(count)
    }

    // ── Public surface ───────────────────────────────────────────────

    /// Queue slot releases for the next cycle.
    ///
    /// Every id is resolved to its owning group and role through the last
    /// status snapshot. If any id cannot be resolved nothing is queued.
    pub fn release_slots(&self, slots: &[SlotId], preference: ReleasePreference) -> ManagerResult<()> {
        let mut resolved = Vec::with_capacity(slots.len());
        let mut unresolved = Vec::new();
        {
            let snapshot = self.snapshot.read().expect("snapshot lock");
            for slot in slots {
                let owner = snapshot
                    .values()
                    .find_map(|status| status.role_for_slot(slot).map(|role| (status, role)));
                match owner {
                    Some((status, role)) => resolved.push(PendingRelease {
                        group: status.group_id.clone(),
                        role: role.clone(),
                        slot: slot.clone(),
                        preference,
                    }),
                    None => unresolved.push(slot.to_string()),
                }
            }
        }
        if !unresolved.is_empty() {
            warn!(unresolved = ?unresolved, "slot release rejected");
            return Err(ManagerError::UnresolvedSlots(unresolved));
        }

        let count = resolved.len();
        self.releases.lock().expect("release queue lock").extend(resolved);
        info!(slots = count, ?preference, "slot releases queued");
        Ok(())
    }

    /// Statuses from the last snapshot. An empty id list means every group.
    pub fn group_status(&self, ids: &[GroupId]) -> ManagerResult<Vec<GroupStatus>> {
        let snapshot = self.snapshot.read().expect("snapshot lock");
        if ids.is_empty() {
            return Ok(snapshot.values().cloned().collect());
        }
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !snapshot.contains_key(*id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ManagerError::UnknownGroups(unknown));
        }
        Ok(ids.iter().filter_map(|id| snapshot.get(id).cloned()).collect())
    }

    #[cfg(debug_assertions)]
    pub fn operator(&self, command: OperatorCommand) {
        match command {
            OperatorCommand::SetInterval(interval) => {
                self.interval_ms
                    .store(interval.as_millis() as u64, Ordering::Relaxed);
                info!(interval_ms = interval.as_millis() as u64, "operator set interval");
            }
            OperatorCommand::StopAllocator => {
                info!("operator stopped allocator");
                self.ctx.allocator.stop();
            }
            OperatorCommand::StartAllocator => {
                info!("operator started allocator");
                self.ctx.allocator.start();
            }
        }
    }

    /// Run cycles until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval().as_millis() as u64, workers = self.pool.width(), "group manager started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval()) => {
                    let report = self.cycle().await;
                    if report.failed > 0 {
                        error!(failed = report.failed, "groups failed to reconcile");
                    }
                }
                _ = shutdown.changed() => {
                    info!("group manager shutting down");
                    break;
                }
            }
        }
    }

    // ── Cycle ────────────────────────────────────────────────────────

    /// One full scheduling cycle.
    pub async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport {
            status_changes: self.refresh_snapshot().await,
            ..CycleReport::default()
        };

        let allocator = self.ctx.allocator.clone();
        if !allocator.is_working() {
            warn!("allocator not working, cycle skipped");
            report.skipped = true;
            return report;
        }
        allocator.before_update();

        self.sync_plans();
        report.removed = self.retire_orphans();
        self.drain_releases();

        let results = self.reconcile_all().await;
        report.reconciled = results.len();
        for (id, result) in results {
            match result {
                Some(Ok(true)) => report.persisted += 1,
                Some(Ok(false)) => {}
                Some(Err(e)) => {
                    warn!(group = %id, code = %e.code(), error = %e, "group reconcile failed");
                    report.failed += 1;
                }
                None => {
                    self.reload_group(&id);
                    report.failed += 1;
                }
            }
        }

        report.released_tags = self.release_unreferenced_tags();
        if let Err(e) = allocator.after_update() {
            warn!(error = %e, "allocator post-update failed");
        }
        debug!(?report, "cycle complete");
        report
    }

    fn shared_groups(&self) -> Vec<(GroupId, SharedGroup)> {
        self.groups
            .read()
            .expect("groups lock")
            .iter()
            .map(|(id, g)| (id.clone(), g.clone()))
            .collect()
    }

    /// Collect statuses, audit the changed ones, then swap the snapshot.
    async fn refresh_snapshot(&self) -> usize {
        let groups = self.shared_groups();
        let jobs: Vec<_> = groups
            .iter()
            .map(|(_, group)| {
                let group = group.clone();
                move || lock_group(&group).status()
            })
            .collect();
        let mut fresh = BTreeMap::new();
        for ((id, _), status) in groups.iter().zip(self.pool.run_all(jobs).await) {
            match status {
                Some(status) => {
                    fresh.insert(id.clone(), status);
                }
                None => self.reload_group(id),
            }
        }

        let changed: Vec<GroupStatus> = {
            let previous = self.snapshot.read().expect("snapshot lock");
            fresh
                .values()
                .filter(|s| previous.get(&s.group_id) != Some(*s))
                .cloned()
                .collect()
        };
        let count = changed.len();
        let jobs: Vec<_> = changed
            .into_iter()
            .map(|status| {
                let audit = self.ctx.audit.clone();
                move || {
                    let group = status.group_id.clone();
                    audit.record(&group, &AuditEvent::StatusChanged(status));
                }
            })
            .collect();
        self.pool.run_all(jobs).await;

        *self.snapshot.write().expect("snapshot lock") = fresh;
        count
    }

    /// Create groups for new plans and push changed plans into existing ones.
    fn sync_plans(&self) {
        let plans = self.plans.plans();
        let mut groups = self.groups.write().expect("groups lock");
        for (id, plan) in plans {
            let group = groups.entry(id.clone()).or_insert_with(|| {
                info!(group = %id, "group added");
                Arc::new(Mutex::new(Group::new(id.clone(), self.ctx.clone())))
            });
            let mut group = lock_group(group);
            if group.version() != plan.version || group.phase() != GroupPhase::Active {
                group.set_plan(plan);
            }
        }
    }

    /// Stop groups whose plan is gone; remove those that finished draining.
    fn retire_orphans(&self) -> Vec<GroupId> {
        let planned: BTreeSet<GroupId> = self.plans.plans().into_keys().collect();
        let mut removed = Vec::new();
        let mut groups = self.groups.write().expect("groups lock");

        for (id, shared) in groups.iter() {
            if planned.contains(id) {
                continue;
            }
            let mut group = lock_group(shared);
            if group.phase() != GroupPhase::Stopping {
                group.stop();
                continue;
            }
            if !group.is_stopped() {
                continue;
            }
            match group.delete_persisted() {
                Ok(_) => removed.push(id.clone()),
                Err(e) => warn!(group = %id, error = %e, "stopped group not deleted, retrying next cycle"),
            }
        }

        for id in &removed {
            groups.remove(id);
            self.ctx.audit.record(id, &AuditEvent::GroupRemoved);
            info!(group = %id, "group removed");
        }
        if !removed.is_empty() {
            let mut snapshot = self.snapshot.write().expect("snapshot lock");
            for id in &removed {
                snapshot.remove(id);
            }
        }
        removed
    }

    fn drain_releases(&self) {
        let pending = std::mem::take(&mut *self.releases.lock().expect("release queue lock"));
        if pending.is_empty() {
            return;
        }
        let groups = self.groups.read().expect("groups lock");
        for release in pending {
            let Some(shared) = groups.get(&release.group) else {
                debug!(group = %release.group, slot = %release.slot, "release for removed group dropped");
                continue;
            };
            let mut group = lock_group(shared);
            if !group.release_slot(&release.role, &release.slot, release.preference) {
                debug!(
                    group = %release.group,
                    role = %release.role,
                    slot = %release.slot,
                    "slot no longer owned, release dropped"
                );
            }
        }
    }

    async fn reconcile_all(&self) -> Vec<(GroupId, Option<GroupResult<bool>>)> {
        let groups = self.shared_groups();
        let jobs: Vec<_> = groups
            .iter()
            .map(|(_, group)| {
                let group = group.clone();
                move || lock_group(&group).reconcile()
            })
            .collect();
        let results = self.pool.run_all(jobs).await;
        groups.into_iter().map(|(id, _)| id).zip(results).collect()
    }

    /// Replace a group whose job panicked with its last persisted state.
    ///
    /// The in-memory copy may be half-executed; the persisted snapshot is
    /// the last state the group committed to. A group that never persisted
    /// starts over empty and picks its plan up in the next cycle.
    fn reload_group(&self, id: &GroupId) {
        let fresh = match Group::recover(id, self.ctx.clone()) {
            Ok(Some(group)) => group,
            Ok(None) => Group::new(id.clone(), self.ctx.clone()),
            Err(e) => {
                error!(group = %id, code = %e.code(), error = %e, "panicked group not reloaded");
                return;
            }
        };
        if let Some(shared) = self.groups.write().expect("groups lock").get_mut(id) {
            *shared = Arc::new(Mutex::new(fresh));
        }
        warn!(group = %id, "group job panicked, reloaded from persisted state");
    }

    fn release_unreferenced_tags(&self) -> usize {
        let referenced: BTreeSet<String> = self
            .shared_groups()
            .iter()
            .flat_map(|(_, group)| lock_group(group).resource_tags())
            .collect();
        let mut released = 0;
        for tag in self.ctx.allocator.tags_in_use() {
            if !referenced.contains(&tag) {
                debug!(%tag, "unreferenced tag released");
                self.ctx.allocator.release_tag(&tag);
                released += 1;
            }
        }
        released
    }
}
