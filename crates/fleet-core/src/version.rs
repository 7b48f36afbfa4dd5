//! Plan version hashing.
//!
//! A plan's version is a content hash of its canonical JSON form. The
//! hasher is swappable so fields that do not affect scheduling can be left
//! out, keeping versions stable across releases that add such fields.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{GroupPlan, ORIGINAL_COUNT_KEY, VersionedGroupPlan};

/// Computes the version of a plan.
pub trait PlanHasher: Send + Sync {
    fn version(&self, plan: &GroupPlan) -> String;

    /// Stamp a plan with its version and a full-content checksum.
    fn stamp(&self, plan: GroupPlan) -> VersionedGroupPlan {
        let version = self.version(&plan);
        let checksum = checksum(&plan);
        VersionedGroupPlan {
            plan,
            version,
            checksum,
        }
    }
}

/// Hashes every field of the plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPlanHasher;

impl PlanHasher for DefaultPlanHasher {
    fn version(&self, plan: &GroupPlan) -> String {
        hash_value(&serde_json::to_value(plan).unwrap_or(Value::Null))
    }
}

/// Leaves routing tags and router-stashed properties out of the version.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompatPlanHasher;

impl PlanHasher for CompatPlanHasher {
    fn version(&self, plan: &GroupPlan) -> String {
        let mut value = serde_json::to_value(plan).unwrap_or(Value::Null);
        if let Some(Value::Object(roles)) = value.get_mut("roles") {
            for role in roles.values_mut() {
                if let Value::Object(fields) = role {
                    fields.remove("routing_tag");
                    if let Some(Value::Object(props)) = fields.get_mut("properties") {
                        props.remove(ORIGINAL_COUNT_KEY);
                    }
                }
            }
        }
        hash_value(&value)
    }
}

/// Checksum of the complete plan, including fields the version ignores.
pub fn checksum(plan: &GroupPlan) -> String {
    hash_value(&serde_json::to_value(plan).unwrap_or(Value::Null))
}

// serde_json's default map is a BTreeMap, so serialization is already key-sorted.
fn hash_value(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RolePlan;

    fn plan() -> GroupPlan {
        GroupPlan::new("g1").with_role("r1", RolePlan::new(3, "/bin/a"))
    }

    #[test]
    fn unchanged_plan_keeps_version() {
        let hasher = DefaultPlanHasher;
        assert_eq!(hasher.version(&plan()), hasher.version(&plan()));
    }

    #[test]
    fn count_change_bumps_version() {
        let hasher = DefaultPlanHasher;
        let mut changed = plan();
        changed.roles.get_mut("r1").unwrap().count = 4;
        assert_ne!(hasher.version(&plan()), hasher.version(&changed));
    }

    #[test]
    fn compat_hasher_ignores_routing_tag() {
        let mut tagged = plan();
        tagged.roles.get_mut("r1").unwrap().routing_tag = Some("blue".to_string());

        assert_eq!(
            CompatPlanHasher.version(&plan()),
            CompatPlanHasher.version(&tagged)
        );
        assert_ne!(
            DefaultPlanHasher.version(&plan()),
            DefaultPlanHasher.version(&tagged)
        );
    }

    #[test]
    fn stamp_checksum_tracks_full_content() {
        let mut tagged = plan();
        tagged.roles.get_mut("r1").unwrap().routing_tag = Some("blue".to_string());

        let a = CompatPlanHasher.stamp(plan());
        let b = CompatPlanHasher.stamp(tagged);
        assert_eq!(a.version, b.version);
        assert_ne!(a.checksum, b.checksum);
        assert_eq!(a.version.len(), 32);
    }
}
