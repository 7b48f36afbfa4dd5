//! Slot scoring for placement decisions.
//!
//! A pooled slot is scored on its health:
//! - **Package installed**: the role's package is already on the slot
//! - **Process running**: the slot is live, not just reserved
//! - **Recoverable**: the allocator has not given up on it
//!
//! Default placement serves the highest score first. Scatter placement
//! applies the same score but subtracts a penalty per slot the bucket
//! already has on that node, re-scoring after every pick.

use std::collections::HashMap;

use fleet_core::config::PlacementKind;
use fleet_core::{SlotId, SlotInfo};

/// Weights for the scoring components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub package_installed: i64,
    pub process_running: i64,
    pub recoverable: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            package_installed: 50,
            process_running: 30,
            recoverable: 100,
        }
    }
}

/// Health score of a single slot (higher = better).
pub fn score_slot(slot: &SlotInfo, weights: &ScoringWeights) -> i64 {
    let mut score = 0;
    if slot.package_installed {
        score += weights.package_installed;
    }
    if slot.process_running {
        score += weights.process_running;
    }
    if !slot.unrecoverable {
        score += weights.recoverable;
    }
    score
}

/// Pool slots ordered for eviction: lowest score first, ties by slot id.
pub fn rank_for_eviction<'a>(pool: &[&'a SlotInfo], weights: &ScoringWeights) -> Vec<&'a SlotInfo> {
    let mut ranked = pool.to_vec();
    ranked.sort_by(|a, b| {
        score_slot(a, weights)
            .cmp(&score_slot(b, weights))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Chooses which pooled slots go to a bucket.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick up to `count` slots out of `candidates` for a bucket that
    /// already holds `assigned`. Never returns a slot twice.
    fn pick(&self, candidates: &[&SlotInfo], assigned: &[&SlotInfo], count: usize) -> Vec<SlotId>;
}

/// Highest health score first.
#[derive(Debug, Clone, Default)]
pub struct DefaultPlacement {
    pub weights: ScoringWeights,
}

impl PlacementStrategy for DefaultPlacement {
    fn name(&self) -> &'static str {
        "default"
    }

    fn pick(&self, candidates: &[&SlotInfo], _assigned: &[&SlotInfo], count: usize) -> Vec<SlotId> {
        let mut ranked = candidates.to_vec();
        ranked.sort_by(|a, b| {
            score_slot(b, &self.weights)
                .cmp(&score_slot(a, &self.weights))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.into_iter().take(count).map(|s| s.id.clone()).collect()
    }
}

/// Health score minus a per-node crowding penalty, picked greedily.
#[derive(Debug, Clone)]
pub struct ScatterPlacement {
    pub weights: ScoringWeights,
    pub node_penalty: i64,
}

impl ScatterPlacement {
    pub fn new(node_penalty: i64) -> Self {
        Self {
            weights: ScoringWeights::default(),
            node_penalty,
        }
    }
}

impl PlacementStrategy for ScatterPlacement {
    fn name(&self) -> &'static str {
        "scatter"
    }

    fn pick(&self, candidates: &[&SlotInfo], assigned: &[&SlotInfo], count: usize) -> Vec<SlotId> {
        let mut per_node: HashMap<&str, i64> = HashMap::new();
        for slot in assigned {
            *per_node.entry(slot.node()).or_default() += 1;
        }

        let mut remaining = candidates.to_vec();
        let mut picked = Vec::with_capacity(count.min(remaining.len()));
        while picked.len() < count && !remaining.is_empty() {
            let adjusted = |slot: &SlotInfo| {
                let crowd = per_node.get(slot.node()).copied().unwrap_or(0);
                score_slot(slot, &self.weights) - crowd * self.node_penalty
            };
            let Some(best) = (0..remaining.len()).max_by(|&a, &b| {
                adjusted(remaining[a])
                    .cmp(&adjusted(remaining[b]))
                    // Equal scores: lower slot id wins.
                    .then_with(|| remaining[b].id.cmp(&remaining[a].id))
            }) else {
                break;
            };
            let slot = remaining.swap_remove(best);
            *per_node.entry(slot.node()).or_default() += 1;
            picked.push(slot.id.clone());
        }
        picked
    }
}

/// Strategy selected by the buffer configuration.
pub fn placement_for(kind: PlacementKind, node_penalty: i64) -> Box<dyn PlacementStrategy> {
    match kind {
        PlacementKind::Default => Box::new(DefaultPlacement::default()),
        PlacementKind::Scatter => Box::new(ScatterPlacement::new(node_penalty)),
    }
}
