//! HoldMatrix — per (role, version) hold computation.
//!
//! Input is each role's availability per version, as a percentage of the
//! role's base count. The matrix spends a shared health budget
//! (`min_health_capacity`) column by column: the latest version first, capped
//! by `latest_version_ratio`, then every earlier version from newest to
//! oldest. A column grants the same amount to every role with data in it,
//! bounded by the smallest remaining availability among those roles.
//!
//! When one role runs dry in a column it would pin every later grant in that
//! column to zero. Follow-up passes mask such a role (at most one per column
//! per pass, first in role order) and grant again over the rest, until the
//! budget is spent or one pass per role has run.

use std::collections::{BTreeMap, BTreeSet};

use fleet_core::{RoleId, Version};
use tracing::trace;

/// Role → version → percentage.
pub type HoldTable = BTreeMap<RoleId, BTreeMap<Version, u32>>;

/// Role × version availability table, consumed in place into holds.
#[derive(Debug, Clone)]
pub struct HoldMatrix {
    roles: Vec<RoleId>,
    /// Earlier versions in lexicographic order, latest last.
    versions: Vec<Version>,
    /// Remaining availability; `None` means no data for the pair.
    remaining: Vec<Vec<Option<u32>>>,
    holds: Vec<Vec<u32>>,
    masked: Vec<Vec<bool>>,
    budget: u32,
    latest_budget: u32,
}

impl HoldMatrix {
    pub fn new(
        availability: &HoldTable,
        latest: &str,
        min_health_capacity: u32,
        latest_version_ratio: u32,
    ) -> Self {
        let roles: Vec<RoleId> = availability.keys().cloned().collect();

        let earlier: BTreeSet<&Version> = availability
            .values()
            .flat_map(|per_version| per_version.keys())
            .filter(|v| v.as_str() != latest)
            .collect();
        let mut versions: Vec<Version> = earlier.into_iter().cloned().collect();
        versions.push(latest.to_string());

        let remaining: Vec<Vec<Option<u32>>> = roles
            .iter()
            .map(|role| {
                let per_version = &availability[role];
                versions
                    .iter()
                    .map(|v| per_version.get(v).copied())
                    .collect()
            })
            .collect();

        let holds = vec![vec![0; versions.len()]; roles.len()];
        let masked = vec![vec![false; versions.len()]; roles.len()];

        Self {
            roles,
            versions,
            remaining,
            holds,
            masked,
            budget: min_health_capacity.min(100),
            latest_budget: latest_version_ratio.min(100),
        }
    }

    /// Health budget not yet granted.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Run every pass and return the accumulated holds for every pair that
    /// had data.
    pub fn compute(mut self) -> HoldTable {
        self.grant_pass();
        for _ in 0..self.roles.len() {
            if !self.follow_up_pass() {
                break;
            }
        }
        self.into_holds()
    }

    /// Mask exhausted roles and grant again. False when there is no budget
    /// left or nothing to mask.
    fn follow_up_pass(&mut self) -> bool {
        if self.budget == 0 || !self.mask_exhausted() {
            return false;
        }
        self.grant_pass();
        true
    }

    fn latest_col(&self) -> usize {
        self.versions.len() - 1
    }

    /// Latest column first, then earlier columns from newest to oldest.
    fn column_order(&self) -> std::iter::Rev<std::ops::Range<usize>> {
        (0..self.versions.len()).rev()
    }

    fn grant_pass(&mut self) {
        for col in self.column_order() {
            if self.budget == 0 {
                break;
            }
            let cap = if col == self.latest_col() {
                self.budget.min(self.latest_budget)
            } else {
                self.budget
            };
            let granted = self.grant_column(col, cap);
            self.budget -= granted;
            if col == self.latest_col() {
                self.latest_budget -= granted;
            }
        }
    }

    /// Grant `min(min remaining over unmasked roles with data, cap)` to each
    /// of those roles. A column without data grants nothing.
    fn grant_column(&mut self, col: usize, cap: u32) -> u32 {
        let live: Vec<usize> = (0..self.roles.len())
            .filter(|&r| !self.masked[r][col] && self.remaining[r][col].is_some())
            .collect();
        let Some(min_available) = live.iter().filter_map(|&r| self.remaining[r][col]).min() else {
            return 0;
        };
        let amount = min_available.min(cap);
        if amount == 0 {
            return 0;
        }
        for r in live {
            if let Some(left) = self.remaining[r][col].as_mut() {
                *left -= amount;
            }
            self.holds[r][col] += amount;
        }
        trace!(version = %self.versions[col], amount, "column granted");
        amount
    }

    /// Mask the first unmasked role with zero remaining in each column.
    /// Returns false if no column had one.
    fn mask_exhausted(&mut self) -> bool {
        let mut any = false;
        for col in self.column_order() {
            let first = (0..self.roles.len())
                .find(|&r| !self.masked[r][col] && self.remaining[r][col] == Some(0));
            if let Some(r) = first {
                self.masked[r][col] = true;
                any = true;
            }
        }
        any
    }

    fn into_holds(self) -> HoldTable {
        let mut out = HoldTable::new();
        for (r, role) in self.roles.iter().enumerate() {
            let per_version = out.entry(role.clone()).or_default();
            for (c, version) in self.versions.iter().enumerate() {
                if self.remaining[r][c].is_some() {
                    per_version.insert(version.clone(), self.holds[r][c]);
                }
            }
        }
        out
    }
}
