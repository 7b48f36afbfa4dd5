//! fleetd.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub allocator: AllocatorSection,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub state: StateSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSection {
    /// Scheduling interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Width of the per-group worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Use the compatibility plan hasher (ignores routing tags).
    #[serde(default)]
    pub compat_hash: bool,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            workers: default_workers(),
            compat_hash: false,
        }
    }
}

impl ManagerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorSection {
    /// Status older than this marks the allocator as not working.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Nodes in the in-process cluster used by standalone mode.
    #[serde(default = "default_sim_nodes")]
    pub sim_nodes: u32,
    #[serde(default = "default_sim_slots_per_node")]
    pub sim_slots_per_node: u32,
}

impl Default for AllocatorSection {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            sim_nodes: default_sim_nodes(),
            sim_slots_per_node: default_sim_slots_per_node(),
        }
    }
}

impl AllocatorSection {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

fn default_stale_after_ms() -> u64 {
    60_000
}

fn default_sim_nodes() -> u32 {
    4
}

fn default_sim_slots_per_node() -> u32 {
    8
}

/// Placement policy used when drawing slots out of the warm pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    #[default]
    Default,
    Scatter,
}

/// Warm-pool configuration for the buffered allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Spare slots to keep requested beyond bucket demand.
    #[serde(default)]
    pub min_pool: u32,
    /// Pool size above which slots go back to the cluster.
    #[serde(default = "default_max_pool")]
    pub max_pool: u32,
    #[serde(default)]
    pub placement: PlacementKind,
    /// Score penalty per slot already on the same node (scatter only).
    #[serde(default = "default_node_penalty")]
    pub node_penalty: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_pool: 0,
            max_pool: default_max_pool(),
            placement: PlacementKind::Default,
            node_penalty: default_node_penalty(),
        }
    }
}

fn default_max_pool() -> u32 {
    16
}

fn default_node_penalty() -> i64 {
    40
}

/// Ratio value meaning "do not send this operation to the backend".
pub const SKIP_RATIO: i32 = -1;

/// Traffic split between the local scheduler and the remote proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_local_ratio")]
    pub local_ratio: i32,
    #[serde(default = "default_proxy_ratio")]
    pub proxy_ratio: i32,
    #[serde(default)]
    pub route_all: bool,
    #[serde(default)]
    pub allow: BTreeSet<String>,
    #[serde(default)]
    pub deny: BTreeSet<String>,
    /// Ordered regex overrides; first match wins.
    #[serde(default)]
    pub overrides: Vec<RouteOverride>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_ratio: default_local_ratio(),
            proxy_ratio: default_proxy_ratio(),
            route_all: false,
            allow: BTreeSet::new(),
            deny: BTreeSet::new(),
            overrides: Vec::new(),
        }
    }
}

fn default_local_ratio() -> i32 {
    100
}

fn default_proxy_ratio() -> i32 {
    SKIP_RATIO
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOverride {
    pub pattern: String,
    pub local_ratio: i32,
    pub proxy_ratio: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "/var/lib/fleetgrid".to_string()
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
