//! Group schedulers — turn a group snapshot into per-role parameters.
//!
//! A scheduler is a pure function of a read-only snapshot: the group's plan,
//! its latest version, and what every role currently reports. Schedulers are
//! picked per group by the name in `GroupPlan::scheduler`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fleet_core::{GroupPlan, RoleId, Version};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};
use crate::hold_matrix::{HoldMatrix, HoldTable};
use crate::params::{ScheduleParams, percent_ceil};

/// Name under which [`DefaultGroupScheduler`] is registered.
pub const DEFAULT_SCHEDULER: &str = "default";

/// What one role reports at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub role_id: RoleId,
    /// Target from the plan; zero for roles draining toward removal.
    pub target_count: u32,
    /// Live instances across all versions.
    pub current_count: u32,
    /// Availability per version, as a percentage of that version's base count.
    pub availability: BTreeMap<Version, u32>,
    /// Base count per version; missing means unknown.
    pub base_counts: BTreeMap<Version, u32>,
}

/// Computes scheduling parameters for every role of a group.
pub trait GroupScheduler: Send + Sync {
    fn name(&self) -> &str;

    fn schedule(
        &self,
        plan: &GroupPlan,
        latest: &str,
        roles: &[RoleSnapshot],
        timestamp: u64,
    ) -> BTreeMap<RoleId, ScheduleParams>;
}

/// Hold-matrix based scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGroupScheduler;

impl DefaultGroupScheduler {
    fn params_for(
        plan: &GroupPlan,
        role: &RoleSnapshot,
        holds: Option<&BTreeMap<Version, u32>>,
        timestamp: u64,
    ) -> ScheduleParams {
        let target = role.target_count;
        let min_health_count = percent_ceil(plan.min_health_capacity, target);

        let holds: BTreeMap<Version, u32> = holds
            .into_iter()
            .flatten()
            .map(|(version, pct)| {
                let base = role.base_counts.get(version).copied().unwrap_or(target);
                (version.clone(), percent_ceil(*pct, base))
            })
            .collect();
        let hold_sum = holds
            .values()
            .fold(0u32, |sum, hold| sum.saturating_add(*hold))
            .max(min_health_count);
        let with_extra = hold_sum.saturating_add(percent_ceil(plan.extra_ratio, hold_sum));

        let max_count = if hold_sum < target {
            target
        } else if hold_sum <= role.current_count {
            role.current_count.min(with_extra)
        } else {
            with_extra
        };

        ScheduleParams {
            timestamp,
            min_health_count,
            holds,
            max_count,
        }
    }
}

impl GroupScheduler for DefaultGroupScheduler {
    fn name(&self) -> &str {
        DEFAULT_SCHEDULER
    }

    fn schedule(
        &self,
        plan: &GroupPlan,
        latest: &str,
        roles: &[RoleSnapshot],
        timestamp: u64,
    ) -> BTreeMap<RoleId, ScheduleParams> {
        let availability: HoldTable = roles
            .iter()
            .map(|r| (r.role_id.clone(), r.availability.clone()))
            .collect();
        let holds = HoldMatrix::new(
            &availability,
            latest,
            plan.min_health_capacity,
            plan.latest_version_ratio,
        )
        .compute();

        let params: BTreeMap<RoleId, ScheduleParams> = roles
            .iter()
            .map(|role| {
                let params = Self::params_for(plan, role, holds.get(&role.role_id), timestamp);
                (role.role_id.clone(), params)
            })
            .collect();
        debug!(group = %plan.group_id, roles = params.len(), %latest, "group scheduled");
        params
    }
}

/// Schedulers by name.
pub struct SchedulerRegistry {
    schedulers: HashMap<String, Arc<dyn GroupScheduler>>,
}

impl SchedulerRegistry {
    pub fn empty() -> Self {
        Self {
            schedulers: HashMap::new(),
        }
    }

    /// Registry with [`DefaultGroupScheduler`] under `"default"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .schedulers
            .insert(DEFAULT_SCHEDULER.to_string(), Arc::new(DefaultGroupScheduler));
        registry
    }

    pub fn register(&mut self, scheduler: Arc<dyn GroupScheduler>) -> RolloutResult<()> {
        let name = scheduler.name().to_string();
        if self.schedulers.contains_key(&name) {
            return Err(RolloutError::DuplicateScheduler { name });
        }
        self.schedulers.insert(name, scheduler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> RolloutResult<Arc<dyn GroupScheduler>> {
        self.schedulers
            .get(name)
            .cloned()
            .ok_or_else(|| RolloutError::UnknownScheduler(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schedulers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
