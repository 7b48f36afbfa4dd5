//! Test doubles shared by the group and manager tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fleet_core::{ReleasePreference, RolePlan, RoleStatus, SlotId, Version};
use fleetgrid_rollout::ScheduleParams;
use fleetgrid_state::{Persistence, StateError, StateResult, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{GroupError, GroupResult};
use crate::role::{Role, RoleContext, RoleFactory};

/// In-memory store whose writes can be made to fail.
pub struct FlakyStore {
    inner: StateStore,
    writes: AtomicUsize,
    pub fail: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: StateStore::open_in_memory().unwrap(),
            writes: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &StateStore {
        &self.inner
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Persistence for FlakyStore {
    fn read(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.inner.read(key)
    }
    fn write(&self, key: &str, value: &[u8]) -> StateResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StateError::Write("injected".to_string()));
        }
        self.inner.write(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn exists(&self, key: &str) -> StateResult<bool> {
        self.inner.exists(key)
    }
    fn remove(&self, key: &str) -> StateResult<bool> {
        self.inner.remove(key)
    }
    fn list(&self, prefix: &str) -> StateResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<(String, AuditEvent)>>,
}

impl RecordingAudit {
    pub fn events(&self) -> Vec<(String, AuditEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn plan_changes(&self) -> usize {
        self.events()
            .iter()
            .filter(|(_, e)| matches!(e, AuditEvent::PlanChanged { .. }))
            .count()
    }

    pub fn status_changes(&self, group: &str) -> usize {
        self.events()
            .iter()
            .filter(|(g, e)| g == group && matches!(e, AuditEvent::StatusChanged(_)))
            .count()
    }

    pub fn removed(&self, group: &str) -> bool {
        self.events()
            .iter()
            .any(|(g, e)| g == group && *e == AuditEvent::GroupRemoved)
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, group: &str, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap()
            .push((group.to_string(), event.clone()));
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FakeState {
    count: u32,
    version: Version,
    instances: u32,
}

/// Role that reaches its target count in a single `execute`.
#[derive(Clone)]
pub struct FakeRole {
    tag: String,
    state: FakeState,
    executions: Arc<AtomicUsize>,
    panics: Arc<AtomicUsize>,
}

impl Role for FakeRole {
    fn debug_id(&self) -> String {
        self.tag.clone()
    }
    fn set_plan(&mut self, plan: &RolePlan, version: &str) {
        self.state.count = plan.count;
        self.state.version = version.to_string();
    }
    fn set_empty_plan(&mut self) {
        self.state.count = 0;
    }
    fn stop(&mut self) {
        self.state.count = 0;
    }
    fn is_stopped(&self) -> bool {
        self.state.count == 0 && self.state.instances == 0
    }
    fn availability(&self) -> BTreeMap<Version, u32> {
        let pct = match self.state.count {
            0 => 0,
            count => self.state.instances * 100 / count,
        };
        BTreeMap::from([(self.state.version.clone(), pct)])
    }
    fn base_count(&self, version: &str) -> Option<u32> {
        (version == self.state.version).then_some(self.state.count)
    }
    fn version_counts(&self) -> BTreeMap<Version, u32> {
        BTreeMap::from([(self.state.version.clone(), self.state.instances)])
    }
    fn remove_version(&mut self, _version: &str) {}
    fn set_schedule_params(&mut self, _params: ScheduleParams) {}
    fn execute(&mut self) {
        let armed = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            panic!("role execute failed");
        }
        self.state.instances = self.state.count;
        self.executions.fetch_add(1, Ordering::SeqCst);
    }
    fn resource_tags(&self) -> BTreeSet<String> {
        BTreeSet::from([self.tag.clone()])
    }
    fn fill_status(&self, status: &mut RoleStatus) {
        status.target_count = self.state.count;
        status.version_counts = self.version_counts();
        status.ready = self.state.instances == self.state.count;
        status.stopped = self.is_stopped();
    }
    fn release_slot(&mut self, _slot: &SlotId, _preference: ReleasePreference) -> bool {
        false
    }
    fn recover_services(&mut self) {}
    fn snapshot(&self) -> Value {
        serde_json::to_value(&self.state).unwrap()
    }
    fn clone_box(&self) -> Box<dyn Role> {
        Box::new(self.clone())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub executions: Arc<AtomicUsize>,
    /// Number of upcoming `execute` calls that panic.
    pub panics: Arc<AtomicUsize>,
}

impl RoleFactory for FakeFactory {
    fn create(&self, ctx: RoleContext) -> Box<dyn Role> {
        Box::new(FakeRole {
            tag: ctx.resource_tag(),
            state: FakeState::default(),
            executions: self.executions.clone(),
            panics: self.panics.clone(),
        })
    }

    fn restore(&self, ctx: RoleContext, snapshot: Value) -> GroupResult<Box<dyn Role>> {
        let state = serde_json::from_value(snapshot).map_err(|e| GroupError::Restore {
            role: ctx.role_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(FakeRole {
            tag: ctx.resource_tag(),
            state,
            executions: self.executions.clone(),
            panics: self.panics.clone(),
        }))
    }
}
