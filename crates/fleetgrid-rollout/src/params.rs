//! Per-role scheduling parameters, recomputed every cycle.

use fleet_core::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a role must do this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleParams {
    /// Unix seconds at which the parameters were computed.
    pub timestamp: u64,
    /// Instances that must stay available at all times.
    pub min_health_count: u32,
    /// Running instances to keep, per version.
    pub holds: BTreeMap<Version, u32>,
    /// Ceiling on total instances this cycle.
    pub max_count: u32,
}

impl ScheduleParams {
    /// Total instances held across versions.
    pub fn hold_total(&self) -> u32 {
        self.holds.values().fold(0, |sum, hold| sum.saturating_add(*hold))
    }
}

/// `ceil(pct% × base)` in integer arithmetic, saturating at `u32::MAX`.
pub fn percent_ceil(pct: u32, base: u32) -> u32 {
    let product = u64::from(pct) * u64::from(base);
    u32::try_from(product.div_ceil(100)).unwrap_or(u32::MAX)
}
