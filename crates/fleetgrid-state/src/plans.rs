//! GroupPlanManager — the versioned store of target plans.
//!
//! Holds the plan-by-group map in memory and persists it as one JSON
//! document. Every mutation is computed on a copy of the map; the copy only
//! replaces the live map once the backing write succeeds.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use fleet_core::{GroupId, GroupPlan, PlanHasher, Version, VersionedGroupPlan};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::persistence::{DiffWriter, Persistence, read_json};

/// Key of the persisted plan map.
pub const PLANS_KEY: &str = "plans/index";

/// Largest accepted `extra_ratio`: a group may surge to 11× its held count.
pub const MAX_EXTRA_RATIO: u32 = 1000;

struct PlanState {
    plans: BTreeMap<GroupId, VersionedGroupPlan>,
    writer: DiffWriter,
}

/// Versioned plan store.
pub struct GroupPlanManager {
    store: Arc<dyn Persistence>,
    hasher: Arc<dyn PlanHasher>,
    state: RwLock<PlanState>,
}

impl GroupPlanManager {
    pub fn new(store: Arc<dyn Persistence>, hasher: Arc<dyn PlanHasher>) -> Self {
        Self {
            store,
            hasher,
            state: RwLock::new(PlanState {
                plans: BTreeMap::new(),
                writer: DiffWriter::new(PLANS_KEY),
            }),
        }
    }

    /// Reload the plan map from persistence. Returns the number of plans.
    pub fn recover(&self) -> StateResult<usize> {
        let raw: Option<BTreeMap<GroupId, GroupPlan>> = read_json(self.store.as_ref(), PLANS_KEY)?;
        let raw = raw.unwrap_or_default();
        let bytes = DiffWriter::encode(&raw)?;
        let plans: BTreeMap<GroupId, VersionedGroupPlan> = raw
            .into_iter()
            .map(|(id, plan)| (id, self.hasher.stamp(plan)))
            .collect();
        let count = plans.len();

        let mut state = self.state.write().expect("plans lock");
        state.plans = plans;
        state.writer = DiffWriter::new(PLANS_KEY).with_last(bytes);
        info!(plans = count, "group plans recovered");
        Ok(count)
    }

    /// Add a new group plan. Fails if the group already exists.
    pub fn add_group(&self, plan: GroupPlan) -> StateResult<Version> {
        validate(&plan)?;
        let mut state = self.state.write().expect("plans lock");
        if state.plans.contains_key(&plan.group_id) {
            return Err(StateError::AlreadyExists(plan.group_id));
        }
        let stamped = self.hasher.stamp(plan);
        let version = stamped.version.clone();
        let mut next = state.plans.clone();
        next.insert(stamped.plan.group_id.clone(), stamped);
        self.commit(&mut state, next)?;
        Ok(version)
    }

    /// Replace an existing group plan.
    pub fn update_group(&self, plan: GroupPlan) -> StateResult<Version> {
        validate(&plan)?;
        let mut state = self.state.write().expect("plans lock");
        let Some(current) = state.plans.get(&plan.group_id) else {
            return Err(StateError::NotFound(plan.group_id));
        };
        if current.plan == plan {
            debug!(group = %plan.group_id, "plan unchanged");
            return Ok(current.version.clone());
        }
        let stamped = self.hasher.stamp(plan);
        let version = stamped.version.clone();
        let mut next = state.plans.clone();
        next.insert(stamped.plan.group_id.clone(), stamped);
        self.commit(&mut state, next)?;
        Ok(version)
    }

    pub fn delete_group(&self, group_id: &str) -> StateResult<()> {
        let mut state = self.state.write().expect("plans lock");
        if !state.plans.contains_key(group_id) {
            return Err(StateError::NotFound(group_id.to_string()));
        }
        let mut next = state.plans.clone();
        next.remove(group_id);
        self.commit(&mut state, next)
    }

    /// Replace every plan at once.
    pub fn set_groups(&self, plans: BTreeMap<GroupId, GroupPlan>) -> StateResult<()> {
        for (id, plan) in &plans {
            if id != &plan.group_id {
                return Err(StateError::InvalidPlan(format!(
                    "key {id} does not match group id {}",
                    plan.group_id
                )));
            }
            validate(plan)?;
        }
        let next = plans
            .into_iter()
            .map(|(id, plan)| (id, self.hasher.stamp(plan)))
            .collect();
        let mut state = self.state.write().expect("plans lock");
        self.commit(&mut state, next)
    }

    /// Snapshot of all versioned plans.
    pub fn plans(&self) -> BTreeMap<GroupId, VersionedGroupPlan> {
        self.state.read().expect("plans lock").plans.clone()
    }

    pub fn get(&self, group_id: &str) -> Option<VersionedGroupPlan> {
        self.state.read().expect("plans lock").plans.get(group_id).cloned()
    }

    // ── Raw JSON access ──────────────────────────────────────────────

    /// Read the value at a JSON pointer into the plan map (`""` is the whole map).
    pub fn read_json(&self, path: &str) -> StateResult<Value> {
        let doc = self.document()?;
        doc.pointer(path)
            .cloned()
            .ok_or_else(|| StateError::NotFound(path.to_string()))
    }

    /// Overwrite an existing value at a JSON pointer.
    pub fn write_json(&self, path: &str, value: Value) -> StateResult<()> {
        self.edit_json(|doc| {
            let slot = doc
                .pointer_mut(path)
                .ok_or_else(|| StateError::NotFound(path.to_string()))?;
            *slot = value;
            Ok(())
        })
    }

    /// Create a value at a JSON pointer whose parent exists.
    pub fn create_json(&self, path: &str, value: Value) -> StateResult<()> {
        let (parent, key) = split_pointer(path)?;
        self.edit_json(|doc| {
            let Some(Value::Object(map)) = doc.pointer_mut(&parent) else {
                return Err(StateError::NotFound(parent.clone()));
            };
            if map.contains_key(&key) {
                return Err(StateError::AlreadyExists(path.to_string()));
            }
            map.insert(key, value);
            Ok(())
        })
    }

    pub fn delete_json(&self, path: &str) -> StateResult<()> {
        let (parent, key) = split_pointer(path)?;
        self.edit_json(|doc| {
            let Some(Value::Object(map)) = doc.pointer_mut(&parent) else {
                return Err(StateError::NotFound(parent.clone()));
            };
            map.remove(&key)
                .map(|_| ())
                .ok_or_else(|| StateError::NotFound(path.to_string()))
        })
    }

    fn document(&self) -> StateResult<Value> {
        let state = self.state.read().expect("plans lock");
        let raw: BTreeMap<&GroupId, &GroupPlan> =
            state.plans.iter().map(|(id, p)| (id, &p.plan)).collect();
        serde_json::to_value(raw).map_err(|e| StateError::Serialize(e.to_string()))
    }

    fn edit_json(&self, edit: impl FnOnce(&mut Value) -> StateResult<()>) -> StateResult<()> {
        let mut state = self.state.write().expect("plans lock");
        let raw: BTreeMap<&GroupId, &GroupPlan> =
            state.plans.iter().map(|(id, p)| (id, &p.plan)).collect();
        let mut doc = serde_json::to_value(raw).map_err(|e| StateError::Serialize(e.to_string()))?;
        edit(&mut doc)?;

        let edited: BTreeMap<GroupId, GroupPlan> =
            serde_json::from_value(doc).map_err(|e| StateError::InvalidPlan(e.to_string()))?;
        for (id, plan) in &edited {
            if id != &plan.group_id {
                return Err(StateError::InvalidPlan(format!(
                    "key {id} does not match group id {}",
                    plan.group_id
                )));
            }
            validate(plan)?;
        }
        let next = edited
            .into_iter()
            .map(|(id, plan)| (id, self.hasher.stamp(plan)))
            .collect();
        self.commit(&mut state, next)
    }

    fn commit(
        &self,
        state: &mut PlanState,
        next: BTreeMap<GroupId, VersionedGroupPlan>,
    ) -> StateResult<()> {
        let raw: BTreeMap<&GroupId, &GroupPlan> = next.iter().map(|(id, p)| (id, &p.plan)).collect();
        if let Err(e) = state.writer.write(self.store.as_ref(), &raw) {
            warn!(error = %e, "plan write failed, keeping previous plans");
            return Err(e);
        }
        state.plans = next;
        Ok(())
    }
}

fn validate(plan: &GroupPlan) -> StateResult<()> {
    if plan.group_id.is_empty() {
        return Err(StateError::InvalidPlan("empty group id".to_string()));
    }
    if plan.min_health_capacity > 100 {
        return Err(StateError::InvalidPlan(format!(
            "{}: min_health_capacity {} exceeds 100",
            plan.group_id, plan.min_health_capacity
        )));
    }
    if plan.extra_ratio > MAX_EXTRA_RATIO {
        return Err(StateError::InvalidPlan(format!(
            "{}: extra_ratio {} exceeds {MAX_EXTRA_RATIO}",
            plan.group_id, plan.extra_ratio
        )));
    }
    if plan.latest_version_ratio > 100 {
        return Err(StateError::InvalidPlan(format!(
            "{}: latest_version_ratio {} exceeds 100",
            plan.group_id, plan.latest_version_ratio
        )));
    }
    Ok(())
}

/// Split a JSON pointer into its parent pointer and unescaped last token.
fn split_pointer(path: &str) -> StateResult<(String, String)> {
    let Some((parent, last)) = path.rsplit_once('/') else {
        return Err(StateError::InvalidPlan(format!("not a JSON pointer: {path:?}")));
    };
    let key = last.replace("~1", "/").replace("~0", "~");
    Ok((parent.to_string(), key))
}
