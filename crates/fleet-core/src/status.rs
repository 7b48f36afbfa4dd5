//! Status snapshots reported by groups and roles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::slot::SlotId;
use crate::types::{GroupId, RoleId, Version};

/// Lifecycle phase of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    #[default]
    NoPlan,
    Active,
    Stopping,
}

/// Point-in-time status of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub version: Version,
    pub phase: GroupPhase,
    pub roles: BTreeMap<RoleId, RoleStatus>,
}

/// Point-in-time status of one role.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role_id: RoleId,
    pub target_count: u32,
    /// Live instance count per version.
    pub version_counts: BTreeMap<Version, u32>,
    /// Every instance of the latest version is up and the target is met.
    pub ready: bool,
    pub stopped: bool,
    pub instances: Vec<InstanceStatus>,
}

/// One live instance and the slot it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub slot: SlotId,
    pub version: Version,
    pub ready: bool,
}

impl GroupStatus {
    pub fn new(group_id: impl Into<GroupId>, version: impl Into<Version>, phase: GroupPhase) -> Self {
        Self {
            group_id: group_id.into(),
            version: version.into(),
            phase,
            roles: BTreeMap::new(),
        }
    }

    /// Find the role that owns `slot`, if any.
    pub fn role_for_slot(&self, slot: &SlotId) -> Option<&RoleId> {
        self.roles
            .iter()
            .find(|(_, role)| role.instances.iter().any(|i| &i.slot == slot))
            .map(|(id, _)| id)
    }
}

impl RoleStatus {
    pub fn new(role_id: impl Into<RoleId>) -> Self {
        Self {
            role_id: role_id.into(),
            ..Self::default()
        }
    }

    /// Total live instances across all versions.
    pub fn instance_count(&self) -> u32 {
        self.version_counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_for_slot_finds_owner() {
        let mut status = GroupStatus::new("g1", "v1", GroupPhase::Active);
        let mut role = RoleStatus::new("r1");
        role.instances.push(InstanceStatus {
            slot: SlotId::new("n1", 0),
            version: "v1".to_string(),
            ready: true,
        });
        status.roles.insert("r1".to_string(), role);
        status.roles.insert("r2".to_string(), RoleStatus::new("r2"));

        assert_eq!(
            status.role_for_slot(&SlotId::new("n1", 0)).map(String::as_str),
            Some("r1")
        );
        assert!(status.role_for_slot(&SlotId::new("n1", 1)).is_none());
    }
}
