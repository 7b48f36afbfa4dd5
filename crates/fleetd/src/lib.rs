//! Assembly of a standalone fleetgrid node.
//!
//! ```text
//! StateStore (redb)
//!   ├── GroupPlanManager ◄── Router ──► ProxyClient (none in standalone)
//!   ├── LocalAllocator ◄── BufferedAllocator (when [buffer] enabled)
//!   └── GroupManager (SimRole per role)
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fleet_core::{CompatPlanHasher, DefaultPlanHasher, FleetConfig, GroupId, GroupPlan, PlanHasher};
use fleetgrid_placement::{BufferedAllocator, LocalAllocator, ResourceAllocator};
use fleetgrid_proxy::Router;
use fleetgrid_rollout::SchedulerRegistry;
use fleetgrid_scheduler::{GroupContext, GroupManager, ManagerConfig, SimRoleFactory, TracingAudit};
use fleetgrid_state::{GroupPlanManager, StateStore};
use tokio::sync::watch;
use tracing::{debug, info};

/// File name of the state database inside the data directory.
pub const DB_FILE: &str = "fleetgrid.redb";

/// Every long-lived component of a node.
pub struct Fleet {
    pub store: StateStore,
    pub plans: Arc<GroupPlanManager>,
    pub cluster: Arc<LocalAllocator>,
    pub allocator: Arc<dyn ResourceAllocator>,
    pub manager: Arc<GroupManager>,
    pub router: Router,
}

/// Open (creating if needed) the state database under `data_dir`.
pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(DB_FILE);
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

impl Fleet {
    pub fn assemble(config: &FleetConfig, store: StateStore) -> anyhow::Result<Self> {
        let persistence = Arc::new(store.clone());

        let hasher: Arc<dyn PlanHasher> = if config.manager.compat_hash {
            Arc::new(CompatPlanHasher)
        } else {
            Arc::new(DefaultPlanHasher)
        };
        let plans = Arc::new(GroupPlanManager::new(persistence.clone(), hasher));

        let cluster = Arc::new(LocalAllocator::new(
            config.allocator.sim_nodes,
            config.allocator.sim_slots_per_node,
            config.allocator.stale_after(),
        ));
        let allocator: Arc<dyn ResourceAllocator> = if config.buffer.enabled {
            info!(
                min_pool = config.buffer.min_pool,
                max_pool = config.buffer.max_pool,
                placement = ?config.buffer.placement,
                "slot buffer enabled"
            );
            Arc::new(BufferedAllocator::new(
                cluster.clone(),
                persistence.clone(),
                config.buffer.clone(),
            )?)
        } else {
            cluster.clone()
        };

        let ctx = GroupContext {
            store: persistence.clone(),
            allocator: allocator.clone(),
            factory: Arc::new(SimRoleFactory),
            schedulers: Arc::new(SchedulerRegistry::with_defaults()),
            audit: Arc::new(TracingAudit),
        };
        let manager = Arc::new(GroupManager::new(
            plans.clone(),
            ctx,
            ManagerConfig::from_section(&config.manager),
        ));
        let router = Router::new(
            plans.clone(),
            manager.clone(),
            None,
            persistence,
            config.router.clone(),
        )?;

        Ok(Self {
            store,
            plans,
            cluster,
            allocator,
            manager,
            router,
        })
    }

    /// Reload persisted plans, buffer state, groups and router config.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let groups = self.manager.recover()?;
        if self.router.recover()? {
            debug!("persisted router config replaces the configured one");
        }
        Ok(groups)
    }

    /// Replace the plan map through the router.
    pub fn seed_plans(&self, plans: BTreeMap<GroupId, GroupPlan>) -> anyhow::Result<()> {
        let count = plans.len();
        self.router.set_groups(plans)?;
        info!(groups = count, "plans seeded");
        Ok(())
    }

    /// Keep the in-process cluster's status fresh until shutdown.
    pub async fn heartbeat(cluster: Arc<LocalAllocator>, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => cluster.refresh(),
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Read a JSON plan map (`{ "<group id>": <plan>, ... }`).
pub fn load_plans(path: &Path) -> anyhow::Result<BTreeMap<GroupId, GroupPlan>> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}
