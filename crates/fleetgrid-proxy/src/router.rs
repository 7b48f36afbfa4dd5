//! Router — splits plan mutations and status reads between the local
//! scheduler and a proxied backend during a migration.
//!
//! # Ratio resolution
//!
//! Per group, first match wins:
//!
//! 1. deny list → local only
//! 2. allow list or `route_all` → the configured `(local, proxy)` ratios
//! 3. first regex override matching the group id → its ratios
//! 4. otherwise → local only
//!
//! A ratio of `-1` skips that backend. Any other value scales every role
//! count to that percentage (rounded up) and stashes the unscaled count in
//! `properties["original_count"]`.
//!
//! Writes go to the proxy first. A proxy failure is recorded and only
//! surfaces when the local write is skipped; a local failure always does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use fleet_core::config::{RouteOverride, RouterConfig, SKIP_RATIO};
use fleet_core::{
    GroupId, GroupPlan, GroupStatus, ORIGINAL_COUNT_KEY, ReleasePreference, RoleStatus, SlotId,
    Version,
};
use fleetgrid_scheduler::ManagerError;
use fleetgrid_state::{DiffWriter, GroupPlanManager, Persistence, read_json};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{LocalBackend, ProxyClient};
use crate::error::{RouterError, RouterResult};

/// Key of the persisted router config.
pub const ROUTER_KEY: &str = "router/config";

/// Resolved `(local, proxy)` percentages for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratios {
    pub local: i32,
    pub proxy: i32,
}

impl Ratios {
    pub const LOCAL_ONLY: Ratios = Ratios {
        local: 100,
        proxy: SKIP_RATIO,
    };

    pub fn local_enabled(&self) -> bool {
        self.local != SKIP_RATIO
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy != SKIP_RATIO
    }
}

/// Config with its override patterns compiled.
struct Routing {
    config: RouterConfig,
    overrides: Vec<(Regex, Ratios)>,
}

impl Routing {
    fn compile(config: RouterConfig) -> RouterResult<Self> {
        check_ratio("local_ratio", config.local_ratio)?;
        check_ratio("proxy_ratio", config.proxy_ratio)?;
        let overrides = config
            .overrides
            .iter()
            .map(compile_override)
            .collect::<RouterResult<Vec<_>>>()?;
        Ok(Self { config, overrides })
    }

    fn ratios_for(&self, group_id: &str) -> Ratios {
        let config = &self.config;
        if config.deny.contains(group_id) {
            return Ratios::LOCAL_ONLY;
        }
        if config.route_all || config.allow.contains(group_id) {
            return Ratios {
                local: config.local_ratio,
                proxy: config.proxy_ratio,
            };
        }
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.is_match(group_id))
            .map_or(Ratios::LOCAL_ONLY, |(_, ratios)| *ratios)
    }
}

fn check_ratio(field: &str, value: i32) -> RouterResult<()> {
    if (SKIP_RATIO..=100).contains(&value) {
        Ok(())
    } else {
        Err(RouterError::InvalidConfig(format!(
            "{field} {value} outside [-1, 100]"
        )))
    }
}

fn compile_override(entry: &RouteOverride) -> RouterResult<(Regex, Ratios)> {
    check_ratio("override local_ratio", entry.local_ratio)?;
    check_ratio("override proxy_ratio", entry.proxy_ratio)?;
    let pattern = Regex::new(&entry.pattern).map_err(|e| {
        RouterError::InvalidConfig(format!("override pattern {:?}: {e}", entry.pattern))
    })?;
    Ok((
        pattern,
        Ratios {
            local: entry.local_ratio,
            proxy: entry.proxy_ratio,
        },
    ))
}

/// Scale every role count to `ratio` percent of its original count.
///
/// The original count is read back from the stash when present, so
/// rewriting an already rewritten plan scales from the same base.
pub fn rewrite_counts(plan: &GroupPlan, ratio: i32) -> GroupPlan {
    let mut out = plan.clone();
    let ratio = u64::from(ratio.clamp(0, 100).unsigned_abs());
    for role in out.roles.values_mut() {
        let original = role.original_count().unwrap_or(role.count);
        role.count = (u64::from(original) * ratio).div_ceil(100) as u32;
        role.properties
            .insert(ORIGINAL_COUNT_KEY.to_string(), original.to_string());
    }
    out
}

pub struct Router {
    plans: Arc<GroupPlanManager>,
    local: Arc<dyn LocalBackend>,
    proxy: Option<Arc<dyn ProxyClient>>,
    store: Arc<dyn Persistence>,
    routing: RwLock<Arc<Routing>>,
    writer: Mutex<DiffWriter>,
    last_proxy_error: Mutex<Option<String>>,
}

impl Router {
    pub fn new(
        plans: Arc<GroupPlanManager>,
        local: Arc<dyn LocalBackend>,
        proxy: Option<Arc<dyn ProxyClient>>,
        store: Arc<dyn Persistence>,
        config: RouterConfig,
    ) -> RouterResult<Self> {
        Ok(Self {
            plans,
            local,
            proxy,
            store,
            routing: RwLock::new(Arc::new(Routing::compile(config)?)),
            writer: Mutex::new(DiffWriter::new(ROUTER_KEY)),
            last_proxy_error: Mutex::new(None),
        })
    }

    fn routing(&self) -> Arc<Routing> {
        self.routing.read().expect("routing lock").clone()
    }

    /// Ratios that apply to `group_id` under the current config.
    pub fn ratios_for(&self, group_id: &str) -> Ratios {
        let ratios = self.routing().ratios_for(group_id);
        if ratios.proxy_enabled() && self.proxy.is_none() {
            return Ratios {
                proxy: SKIP_RATIO,
                ..ratios
            };
        }
        ratios
    }

    /// Most recent proxy failure, if any.
    pub fn last_proxy_error(&self) -> Option<String> {
        self.last_proxy_error.lock().expect("proxy error lock").clone()
    }

    // ── Config ───────────────────────────────────────────────────────

    pub fn config(&self) -> RouterConfig {
        self.routing().config.clone()
    }

    /// Validate, persist, then swap in a new config. Nothing changes on error.
    pub fn set_config(&self, config: RouterConfig) -> RouterResult<()> {
        let routing = Routing::compile(config)?;
        {
            let mut writer = self.writer.lock().expect("router writer lock");
            writer.write(self.store.as_ref(), &routing.config)?;
        }
        info!(
            local_ratio = routing.config.local_ratio,
            proxy_ratio = routing.config.proxy_ratio,
            route_all = routing.config.route_all,
            overrides = routing.overrides.len(),
            "router config updated"
        );
        *self.routing.write().expect("routing lock") = Arc::new(routing);
        Ok(())
    }

    /// Load the persisted config, if one was saved.
    pub fn recover(&self) -> RouterResult<bool> {
        let Some(config) = read_json::<RouterConfig>(self.store.as_ref(), ROUTER_KEY)? else {
            return Ok(false);
        };
        let bytes = DiffWriter::encode(&config)?;
        let routing = Routing::compile(config)?;
        *self.writer.lock().expect("router writer lock") = DiffWriter::new(ROUTER_KEY).with_last(bytes);
        *self.routing.write().expect("routing lock") = Arc::new(routing);
        info!("router config recovered");
        Ok(true)
    }

    // ── Plan mutations ───────────────────────────────────────────────

    /// Returns the local version, or `None` when the local write was skipped.
    pub fn add_group(&self, plan: GroupPlan) -> RouterResult<Option<Version>> {
        let ratios = self.ratios_for(&plan.group_id);
        let proxied = self.call_proxy(ratios, &plan.group_id, |proxy| {
            proxy.add_group(&rewrite_counts(&plan, ratios.proxy))
        });
        let local = match ratios.local_enabled() {
            true => Some(self.plans.add_group(rewrite_counts(&plan, ratios.local))?),
            false => None,
        };
        settle(&plan.group_id, ratios, proxied)?;
        Ok(local)
    }

    pub fn update_group(&self, plan: GroupPlan) -> RouterResult<Option<Version>> {
        let ratios = self.ratios_for(&plan.group_id);
        let proxied = self.call_proxy(ratios, &plan.group_id, |proxy| {
            proxy.update_group(&rewrite_counts(&plan, ratios.proxy))
        });
        let local = match ratios.local_enabled() {
            true => Some(self.plans.update_group(rewrite_counts(&plan, ratios.local))?),
            false => None,
        };
        settle(&plan.group_id, ratios, proxied)?;
        Ok(local)
    }

    pub fn delete_group(&self, group_id: &str) -> RouterResult<()> {
        let ratios = self.ratios_for(group_id);
        let proxied = self.call_proxy(ratios, group_id, |proxy| proxy.delete_group(group_id));
        if ratios.local_enabled() {
            self.plans.delete_group(group_id)?;
        }
        settle(group_id, ratios, proxied)
    }

    /// Replace the whole plan map on both backends.
    pub fn set_groups(&self, plans: BTreeMap<GroupId, GroupPlan>) -> RouterResult<()> {
        let mut local = BTreeMap::new();
        let mut proxied = BTreeMap::new();
        for (id, plan) in &plans {
            let ratios = self.ratios_for(id);
            if ratios.local_enabled() {
                local.insert(id.clone(), rewrite_counts(plan, ratios.local));
            }
            if ratios.proxy_enabled() {
                proxied.insert(id.clone(), rewrite_counts(plan, ratios.proxy));
            }
        }

        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.set_groups(&proxied) {
                self.record_proxy_failure("*", &e);
            }
        }
        debug!(local = local.len(), proxied = proxied.len(), "plan map split");
        self.plans.set_groups(local)?;
        Ok(())
    }

    fn call_proxy(
        &self,
        ratios: Ratios,
        group_id: &str,
        call: impl FnOnce(&dyn ProxyClient) -> RouterResult<()>,
    ) -> Option<RouterResult<()>> {
        if !ratios.proxy_enabled() {
            return None;
        }
        let proxy = self.proxy.as_ref()?;
        let result = call(proxy.as_ref());
        if let Err(e) = &result {
            self.record_proxy_failure(group_id, e);
        }
        Some(result)
    }

    fn record_proxy_failure(&self, group_id: &str, error: &RouterError) {
        warn!(group = group_id, error = %error, "proxy write failed");
        *self.last_proxy_error.lock().expect("proxy error lock") = Some(error.to_string());
    }

    // ── Raw plan JSON ────────────────────────────────────────────────

    pub fn read_json(&self, path: &str) -> RouterResult<Value> {
        Ok(self.plans.read_json(path)?)
    }

    pub fn write_json(&self, path: &str, value: Value) -> RouterResult<()> {
        Ok(self.plans.write_json(path, value)?)
    }

    pub fn create_json(&self, path: &str, value: Value) -> RouterResult<()> {
        Ok(self.plans.create_json(path, value)?)
    }

    pub fn delete_json(&self, path: &str) -> RouterResult<()> {
        Ok(self.plans.delete_json(path)?)
    }

    // ── Status and releases ──────────────────────────────────────────

    /// Merged statuses. An empty id list means every group either side knows.
    pub fn group_status(&self, ids: &[GroupId]) -> RouterResult<Vec<GroupStatus>> {
        let local: BTreeMap<GroupId, GroupStatus> = self
            .local
            .group_status(&[])?
            .into_iter()
            .map(|s| (s.group_id.clone(), s))
            .collect();
        let mut remote: BTreeMap<GroupId, GroupStatus> = BTreeMap::new();
        if let Some(proxy) = &self.proxy {
            match proxy.group_status(ids) {
                Ok(statuses) => remote.extend(statuses.into_iter().map(|s| (s.group_id.clone(), s))),
                Err(e) => warn!(error = %e, "proxy status read failed, reporting local only"),
            }
        }

        let wanted: Vec<GroupId> = if ids.is_empty() {
            local
                .keys()
                .chain(remote.keys())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            ids.to_vec()
        };
        let unknown: Vec<String> = wanted
            .iter()
            .filter(|id| !local.contains_key(*id) && !remote.contains_key(*id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(RouterError::UnknownGroups(unknown));
        }

        Ok(wanted
            .iter()
            .filter_map(|id| merge_status(local.get(id).cloned(), remote.get(id).cloned()))
            .collect())
    }

    /// Release slots locally; slots the local side cannot resolve go to the
    /// proxy's reclaim call instead.
    pub fn release_slots(&self, slots: &[SlotId], preference: ReleasePreference) -> RouterResult<()> {
        match self.local.release_slots(slots, preference) {
            Ok(()) => Ok(()),
            Err(ManagerError::UnresolvedSlots(unresolved)) => {
                let Some(proxy) = &self.proxy else {
                    return Err(ManagerError::UnresolvedSlots(unresolved).into());
                };
                info!(slots = slots.len(), "slots unknown locally, reclaiming through proxy");
                proxy.reclaim_nodes(slots, preference)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Proxy failures only surface when the local write was skipped.
fn settle(group_id: &str, ratios: Ratios, proxied: Option<RouterResult<()>>) -> RouterResult<()> {
    if ratios.local_enabled() {
        return Ok(());
    }
    match proxied {
        Some(result) => result,
        None => Err(RouterError::NoBackend(group_id.to_string())),
    }
}

/// Merge one group's statuses, local fields first.
///
/// The proxy's version label is rewritten to the local one before counts
/// are combined.
pub fn merge_status(local: Option<GroupStatus>, remote: Option<GroupStatus>) -> Option<GroupStatus> {
    let (mut merged, remote) = match (local, remote) {
        (Some(local), Some(remote)) => (local, remote),
        (Some(only), None) | (None, Some(only)) => return Some(only),
        (None, None) => return None,
    };
    let relabel = |version: Version| {
        if version == remote.version {
            merged.version.clone()
        } else {
            version
        }
    };

    let mut roles = std::mem::take(&mut merged.roles);
    for (role_id, theirs) in remote.roles.clone() {
        let theirs = RoleStatus {
            version_counts: theirs
                .version_counts
                .into_iter()
                .map(|(v, n)| (relabel(v), n))
                .fold(BTreeMap::new(), |mut acc, (v, n)| {
                    *acc.entry(v).or_insert(0) += n;
                    acc
                }),
            instances: theirs
                .instances
                .into_iter()
                .map(|mut i| {
                    i.version = relabel(i.version);
                    i
                })
                .collect(),
            ..theirs
        };
        match roles.get_mut(&role_id) {
            Some(ours) => {
                ours.target_count += theirs.target_count;
                for (version, count) in theirs.version_counts {
                    *ours.version_counts.entry(version).or_insert(0) += count;
                }
                ours.ready &= theirs.ready;
                ours.stopped &= theirs.stopped;
                ours.instances.extend(theirs.instances);
            }
            None => {
                roles.insert(role_id, theirs);
            }
        }
    }
    merged.roles = roles;
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DefaultPlanHasher, GroupPhase, InstanceStatus, RolePlan};
    use fleetgrid_scheduler::ManagerResult;
    use fleetgrid_state::StateStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingProxy {
        fail: AtomicBool,
        plans: Mutex<BTreeMap<GroupId, GroupPlan>>,
        statuses: Mutex<Vec<GroupStatus>>,
        reclaimed: Mutex<Vec<SlotId>>,
    }

    impl RecordingProxy {
        fn check(&self) -> RouterResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RouterError::Proxy("unreachable".to_string()));
            }
            Ok(())
        }
    }

    impl ProxyClient for RecordingProxy {
        fn add_group(&self, plan: &GroupPlan) -> RouterResult<()> {
            self.check()?;
            self.plans.lock().unwrap().insert(plan.group_id.clone(), plan.clone());
            Ok(())
        }
        fn update_group(&self, plan: &GroupPlan) -> RouterResult<()> {
            self.add_group(plan)
        }
        fn delete_group(&self, group_id: &str) -> RouterResult<()> {
            self.check()?;
            self.plans.lock().unwrap().remove(group_id);
            Ok(())
        }
        fn set_groups(&self, plans: &BTreeMap<GroupId, GroupPlan>) -> RouterResult<()> {
            self.check()?;
            *self.plans.lock().unwrap() = plans.clone();
            Ok(())
        }
        fn group_status(&self, ids: &[GroupId]) -> RouterResult<Vec<GroupStatus>> {
            self.check()?;
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|s| ids.is_empty() || ids.contains(&s.group_id))
                .cloned()
                .collect())
        }
        fn reclaim_nodes(&self, slots: &[SlotId], _preference: ReleasePreference) -> RouterResult<()> {
            self.check()?;
            self.reclaimed.lock().unwrap().extend_from_slice(slots);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StaticLocal {
        statuses: Vec<GroupStatus>,
        known_slots: Vec<SlotId>,
    }

    impl LocalBackend for StaticLocal {
        fn group_status(&self, _ids: &[GroupId]) -> ManagerResult<Vec<GroupStatus>> {
            Ok(self.statuses.clone())
        }
        fn release_slots(&self, slots: &[SlotId], _preference: ReleasePreference) -> ManagerResult<()> {
            let unresolved: Vec<String> = slots
                .iter()
                .filter(|s| !self.known_slots.contains(s))
                .map(|s| s.to_string())
                .collect();
            match unresolved.is_empty() {
                true => Ok(()),
                false => Err(ManagerError::UnresolvedSlots(unresolved)),
            }
        }
    }

    struct Fixture {
        router: Router,
        plans: Arc<GroupPlanManager>,
        proxy: Arc<RecordingProxy>,
        store: StateStore,
    }

    fn fixture(config: RouterConfig, local: StaticLocal) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let plans = Arc::new(GroupPlanManager::new(Arc::new(store.clone()), Arc::new(DefaultPlanHasher)));
        let proxy = Arc::new(RecordingProxy::default());
        let router = Router::new(
            plans.clone(),
            Arc::new(local),
            Some(proxy.clone()),
            Arc::new(store.clone()),
            config,
        )
        .unwrap();
        Fixture {
            router,
            plans,
            proxy,
            store,
        }
    }

    fn override_config(pattern: &str, local: i32, proxy: i32) -> RouterConfig {
        RouterConfig {
            overrides: vec![RouteOverride {
                pattern: pattern.to_string(),
                local_ratio: local,
                proxy_ratio: proxy,
            }],
            ..RouterConfig::default()
        }
    }

    fn plan(id: &str, count: u32) -> GroupPlan {
        GroupPlan::new(id).with_role("web", RolePlan::new(count, "/bin/web"))
    }

    #[test]
    fn ratio_resolution_order() {
        let mut config = override_config("^mig-", 50, 50);
        config.deny.insert("mig-denied".to_string());
        config.allow.insert("chosen".to_string());
        config.local_ratio = 30;
        config.proxy_ratio = 70;
        let fx = fixture(config, StaticLocal::default());

        assert_eq!(fx.router.ratios_for("mig-denied"), Ratios::LOCAL_ONLY);
        assert_eq!(fx.router.ratios_for("chosen"), Ratios { local: 30, proxy: 70 });
        assert_eq!(fx.router.ratios_for("mig-a"), Ratios { local: 50, proxy: 50 });
        assert_eq!(fx.router.ratios_for("other"), Ratios::LOCAL_ONLY);
    }

    #[test]
    fn override_skipping_local_sends_full_plan_to_proxy() {
        let fx = fixture(override_config("^mig-", -1, 100), StaticLocal::default());

        let version = fx.router.add_group(plan("mig-1", 7)).unwrap();
        assert_eq!(version, None);
        assert!(fx.plans.get("mig-1").is_none());

        let sent = fx.proxy.plans.lock().unwrap()["mig-1"].clone();
        assert_eq!(sent.roles["web"].count, 7);
        assert_eq!(sent.roles["web"].original_count(), Some(7));
    }

    #[test]
    fn split_counts_round_up() {
        let fx = fixture(override_config(".*", 50, 50), StaticLocal::default());
        fx.router.add_group(plan("g1", 5)).unwrap();

        assert_eq!(fx.plans.get("g1").unwrap().plan.roles["web"].count, 3);
        assert_eq!(fx.proxy.plans.lock().unwrap()["g1"].roles["web"].count, 3);
    }

    #[test]
    fn rewrite_scales_from_stashed_original() {
        let once = rewrite_counts(&plan("g1", 10), 30);
        assert_eq!(once.roles["web"].count, 3);
        let twice = rewrite_counts(&once, 50);
        assert_eq!(twice.roles["web"].count, 5);
        assert_eq!(twice.roles["web"].original_count(), Some(10));
    }

    #[test]
    fn proxy_failure_is_recorded_but_local_write_succeeds() {
        let fx = fixture(override_config(".*", 100, 100), StaticLocal::default());
        fx.proxy.fail.store(true, Ordering::SeqCst);

        let version = fx.router.add_group(plan("g1", 2)).unwrap();
        assert!(version.is_some());
        assert!(fx.router.last_proxy_error().unwrap().contains("unreachable"));
    }

    #[test]
    fn proxy_failure_surfaces_when_local_skipped() {
        let fx = fixture(override_config(".*", -1, 100), StaticLocal::default());
        fx.proxy.fail.store(true, Ordering::SeqCst);

        let err = fx.router.add_group(plan("g1", 2)).unwrap_err();
        assert_eq!(err.code(), fleet_core::ErrorCode::ProxyFailure);
    }

    #[test]
    fn write_with_no_backend_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let plans = Arc::new(GroupPlanManager::new(Arc::new(store.clone()), Arc::new(DefaultPlanHasher)));
        let router = Router::new(
            plans.clone(),
            Arc::new(StaticLocal::default()),
            None,
            Arc::new(store),
            override_config(".*", -1, 100),
        )
        .unwrap();

        assert_eq!(router.ratios_for("g1"), Ratios { local: -1, proxy: -1 });
        let err = router.add_group(plan("g1", 1)).unwrap_err();
        assert!(matches!(err, RouterError::NoBackend(_)));
        assert!(plans.get("g1").is_none());
    }

    #[test]
    fn set_groups_partitions_by_ratio() {
        let fx = fixture(override_config("^mig-", -1, 100), StaticLocal::default());
        let plans = BTreeMap::from([
            ("mig-1".to_string(), plan("mig-1", 2)),
            ("stay".to_string(), plan("stay", 3)),
        ]);
        fx.router.set_groups(plans).unwrap();

        assert_eq!(fx.plans.plans().keys().collect::<Vec<_>>(), vec!["stay"]);
        assert_eq!(fx.proxy.plans.lock().unwrap().keys().collect::<Vec<_>>(), vec!["mig-1"]);
    }

    #[test]
    fn invalid_config_leaves_previous_config() {
        let fx = fixture(override_config("^a", 100, -1), StaticLocal::default());
        let before = fx.router.config();

        let bad_ratio = RouterConfig {
            local_ratio: 101,
            ..RouterConfig::default()
        };
        assert!(matches!(fx.router.set_config(bad_ratio), Err(RouterError::InvalidConfig(_))));
        let bad_regex = override_config("([", 50, 50);
        assert!(matches!(fx.router.set_config(bad_regex), Err(RouterError::InvalidConfig(_))));

        assert_eq!(fx.router.config(), before);
        assert!(!fx.store.exists(ROUTER_KEY).unwrap());
    }

    #[test]
    fn config_persists_and_recovers() {
        let fx = fixture(RouterConfig::default(), StaticLocal::default());
        let config = override_config("^mig-", -1, 100);
        fx.router.set_config(config.clone()).unwrap();

        let other = fixture(RouterConfig::default(), StaticLocal::default());
        let restarted = Router::new(
            other.plans.clone(),
            Arc::new(StaticLocal::default()),
            None,
            Arc::new(fx.store.clone()),
            RouterConfig::default(),
        )
        .unwrap();
        assert!(restarted.recover().unwrap());
        assert_eq!(restarted.config(), config);
    }

    #[test]
    fn status_merge_relabels_proxy_versions() {
        let mut local = GroupStatus::new("g1", "local-v", GroupPhase::Active);
        local.roles.insert(
            "web".to_string(),
            RoleStatus {
                role_id: "web".to_string(),
                target_count: 2,
                version_counts: BTreeMap::from([("local-v".to_string(), 2)]),
                ready: true,
                stopped: false,
                instances: vec![InstanceStatus {
                    slot: SlotId::new("a", 0),
                    version: "local-v".to_string(),
                    ready: true,
                }],
            },
        );
        let mut remote = GroupStatus::new("g1", "proxy-v", GroupPhase::Active);
        remote.roles.insert(
            "web".to_string(),
            RoleStatus {
                role_id: "web".to_string(),
                target_count: 3,
                version_counts: BTreeMap::from([("proxy-v".to_string(), 3)]),
                ready: false,
                stopped: false,
                instances: vec![InstanceStatus {
                    slot: SlotId::new("p", 0),
                    version: "proxy-v".to_string(),
                    ready: false,
                }],
            },
        );

        let fx = fixture(RouterConfig::default(), StaticLocal {
            statuses: vec![local],
            ..StaticLocal::default()
        });
        fx.proxy.statuses.lock().unwrap().push(remote);

        let merged = fx.router.group_status(&["g1".to_string()]).unwrap();
        let web = &merged[0].roles["web"];
        assert_eq!(merged[0].version, "local-v");
        assert_eq!(web.target_count, 5);
        assert_eq!(web.version_counts, BTreeMap::from([("local-v".to_string(), 5)]));
        assert!(!web.ready);
        assert_eq!(web.instances.len(), 2);
        assert!(web.instances.iter().all(|i| i.version == "local-v"));

        let err = fx.router.group_status(&["ghost".to_string()]).unwrap_err();
        assert!(matches!(err, RouterError::UnknownGroups(_)));
    }

    #[test]
    fn unresolved_release_goes_to_proxy_reclaim() {
        let known = SlotId::new("a", 0);
        let fx = fixture(RouterConfig::default(), StaticLocal {
            known_slots: vec![known.clone()],
            ..StaticLocal::default()
        });

        fx.router.release_slots(&[known], ReleasePreference::soft()).unwrap();
        assert!(fx.proxy.reclaimed.lock().unwrap().is_empty());

        let remote = SlotId::new("p", 3);
        fx.router.release_slots(&[remote.clone()], ReleasePreference::hard()).unwrap();
        assert_eq!(*fx.proxy.reclaimed.lock().unwrap(), vec![remote]);
    }

    #[test]
    fn raw_json_bypasses_rewriting() {
        let fx = fixture(override_config(".*", 50, 50), StaticLocal::default());
        fx.router.add_group(plan("g1", 4)).unwrap();

        fx.router.write_json("/g1/roles/web/count", Value::from(9)).unwrap();
        assert_eq!(fx.router.read_json("/g1/roles/web/count").unwrap(), Value::from(9));
        assert_eq!(fx.plans.get("g1").unwrap().plan.roles["web"].count, 9);
    }
}
