//! Declarative plan types shared across fleetgrid crates.
//!
//! A `GroupPlan` is the target topology for one group: a set of roles,
//! each with a replica count and the process it runs. Plans are only
//! changed by explicit update calls; the scheduler converges live state
//! toward them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a group.
pub type GroupId = String;

/// Identifier of a role within its group.
pub type RoleId = String;

/// Opaque content-hash version of a group plan.
pub type Version = String;

/// Property key under which the router stashes a role's unscaled count.
pub const ORIGINAL_COUNT_KEY: &str = "original_count";

/// Target plan for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPlan {
    pub group_id: GroupId,
    /// Percentage (0–100) of each role's target that must stay available.
    #[serde(default)]
    pub min_health_capacity: u32,
    /// Extra churn allowed above the held instances, as a percentage.
    #[serde(default)]
    pub extra_ratio: u32,
    /// Share of the health budget reserved for the newest version first.
    #[serde(default = "default_latest_version_ratio")]
    pub latest_version_ratio: u32,
    #[serde(default)]
    pub roles: BTreeMap<RoleId, RolePlan>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_latest_version_ratio() -> u32 {
    100
}

/// Target for a single role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePlan {
    /// Target replica count.
    pub count: u32,
    pub process: ProcessInfo,
    /// Routing-only tag; does not influence scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_tag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// The process a role's instances run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub binary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Named scheduler selection plus free-form options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            options: BTreeMap::new(),
        }
    }
}

/// A plan stamped with its content version and checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedGroupPlan {
    pub plan: GroupPlan,
    pub version: Version,
    pub checksum: String,
}

impl GroupPlan {
    /// Create an empty plan with the default scheduler.
    pub fn new(group_id: impl Into<GroupId>) -> Self {
        Self {
            group_id: group_id.into(),
            min_health_capacity: 0,
            extra_ratio: 0,
            latest_version_ratio: default_latest_version_ratio(),
            roles: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Builder-style helper to add a role.
    pub fn with_role(mut self, role_id: impl Into<RoleId>, role: RolePlan) -> Self {
        self.roles.insert(role_id.into(), role);
        self
    }

    /// Zero the health floor and every role's count, in place.
    pub fn zero_out(&mut self) {
        self.min_health_capacity = 0;
        for role in self.roles.values_mut() {
            role.count = 0;
        }
    }

    /// Total target replicas across all roles.
    pub fn total_count(&self) -> u32 {
        self.roles.values().map(|r| r.count).sum()
    }
}

impl RolePlan {
    pub fn new(count: u32, binary: impl Into<String>) -> Self {
        Self {
            count,
            process: ProcessInfo {
                binary: binary.into(),
                ..ProcessInfo::default()
            },
            routing_tag: None,
            properties: BTreeMap::new(),
        }
    }

    /// The count stashed by a ratio rewrite, if any.
    pub fn original_count(&self) -> Option<u32> {
        self.properties
            .get(ORIGINAL_COUNT_KEY)
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_out_clears_counts_and_health() {
        let mut plan = GroupPlan::new("g1")
            .with_role("r1", RolePlan::new(3, "/bin/a"))
            .with_role("r2", RolePlan::new(5, "/bin/b"));
        plan.min_health_capacity = 80;

        plan.zero_out();

        assert_eq!(plan.min_health_capacity, 0);
        assert_eq!(plan.total_count(), 0);
        assert_eq!(plan.roles.len(), 2);
    }

    #[test]
    fn parses_minimal_plan_with_defaults() {
        let json = r#"{"group_id":"g1","roles":{"r1":{"count":2,"process":{"binary":"/bin/x"}}}}"#;
        let plan: GroupPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.latest_version_ratio, 100);
        assert_eq!(plan.scheduler.name, "default");
        assert_eq!(plan.roles["r1"].count, 2);
    }

    #[test]
    fn original_count_reads_stashed_property() {
        let mut role = RolePlan::new(4, "/bin/x");
        assert_eq!(role.original_count(), None);
        role.properties
            .insert(ORIGINAL_COUNT_KEY.to_string(), "10".to_string());
        assert_eq!(role.original_count(), Some(10));
    }
}
