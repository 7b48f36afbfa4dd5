//! SlotsBuffer — demand buckets plus a free pool of warm slots.
//!
//! Every slot the buffer holds is in exactly one place: one bucket
//! ([`VirtualTag`]) or the pool. [`SlotsBuffer::commit`] folds one cycle of
//! cluster state, releases and targets into that layout and returns the
//! slots that must go back to the cluster.

use std::collections::{BTreeMap, BTreeSet};

use fleet_core::config::BufferConfig;
use fleet_core::{PreferenceKind, ReleasePreference, SlotId, SlotInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scorer::{PlacementStrategy, ScoringWeights, rank_for_eviction, score_slot};

/// A named demand bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualTag {
    pub name: String,
    pub target: u32,
    pub slots: BTreeSet<SlotId>,
    /// Unix seconds of the last target change.
    pub target_changed_at: u64,
}

impl VirtualTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: 0,
            slots: BTreeSet::new(),
            target_changed_at: 0,
        }
    }

    fn shortfall(&self) -> usize {
        (self.target as usize).saturating_sub(self.slots.len())
    }
}

/// What the buffer persists: its config and the bucket table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferState {
    pub config: BufferConfig,
    pub tags: BTreeMap<String, VirtualTag>,
}

/// Result of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Slots to hand back to the cluster.
    pub to_release: Vec<(SlotId, ReleasePreference)>,
    /// Slots moved from the pool into buckets.
    pub assigned: usize,
}

#[derive(Debug, Clone)]
pub struct SlotsBuffer {
    config: BufferConfig,
    weights: ScoringWeights,
    tags: BTreeMap<String, VirtualTag>,
    pool: BTreeSet<SlotId>,
    /// Last live view of every held slot; never persisted.
    live: BTreeMap<SlotId, SlotInfo>,
    /// Targets requested since the last commit.
    requests: BTreeMap<String, u32>,
    releases: Vec<(SlotId, ReleasePreference)>,
}

impl SlotsBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            weights: ScoringWeights::default(),
            tags: BTreeMap::new(),
            pool: BTreeSet::new(),
            live: BTreeMap::new(),
            requests: BTreeMap::new(),
            releases: Vec::new(),
        }
    }

    /// Rebuild from persisted state. The pool is re-derived on the next
    /// commit from whatever live slots no bucket claims.
    pub fn restore(state: BufferState) -> Self {
        let mut buffer = Self::new(state.config);
        buffer.tags = state.tags;
        buffer
    }

    pub fn state(&self) -> BufferState {
        BufferState {
            config: self.config.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: BufferConfig) {
        self.config = config;
    }

    pub fn pool(&self) -> &BTreeSet<SlotId> {
        &self.pool
    }

    pub fn tag(&self, name: &str) -> Option<&VirtualTag> {
        self.tags.get(name)
    }

    pub fn tag_names(&self) -> BTreeSet<String> {
        self.tags.keys().cloned().collect()
    }

    /// Live info of every slot assigned to `tag`.
    pub fn slots(&self, tag: &str) -> Vec<SlotInfo> {
        self.tags
            .get(tag)
            .into_iter()
            .flat_map(|t| t.slots.iter())
            .filter_map(|id| self.live.get(id).cloned())
            .collect()
    }

    /// Record a target for `tag`, applied on the next commit.
    pub fn request(&mut self, tag: &str, count: u32) {
        self.requests.insert(tag.to_string(), count);
    }

    /// Queue an explicit release, applied on the next commit.
    pub fn release_slot(&mut self, slot: SlotId, preference: ReleasePreference) {
        self.releases.push((slot, preference));
    }

    /// Drop a bucket; its slots go to the pool right away.
    pub fn release_tag(&mut self, tag: &str) {
        self.requests.remove(tag);
        if let Some(bucket) = self.tags.remove(tag) {
            debug!(tag, slots = bucket.slots.len(), "bucket released to pool");
            self.pool.extend(bucket.slots);
        }
    }

    /// Cluster-level count to request: every bucket target plus `min_pool`.
    pub fn combined_request(&self) -> u32 {
        let targets: u32 = self.tags.values().map(|t| t.target).sum();
        targets + self.config.min_pool
    }

    /// Fold one cycle into the buffer.
    ///
    /// `live` is every slot the cluster currently grants the buffer.
    pub fn commit(
        &mut self,
        live: Vec<SlotInfo>,
        now: u64,
        strategy: &dyn PlacementStrategy,
    ) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();
        self.refresh(live);
        self.apply_releases(&mut outcome);
        self.apply_targets(now);
        self.shrink_buckets();
        outcome.assigned = self.fill_buckets(strategy);
        self.trim_pool(&mut outcome);
        debug!(
            pool = self.pool.len(),
            buckets = self.tags.len(),
            assigned = outcome.assigned,
            released = outcome.to_release.len(),
            "buffer committed"
        );
        outcome
    }

    // ── Commit phases ─────────────────────────────────────────────────

    /// Replace the live view, drop dead slots, admit new ones to the pool.
    fn refresh(&mut self, live: Vec<SlotInfo>) {
        self.live = live.into_iter().map(|s| (s.id.clone(), s)).collect();

        let live = &self.live;
        for bucket in self.tags.values_mut() {
            bucket.slots.retain(|id| live.contains_key(id));
        }
        self.pool.retain(|id| live.contains_key(id));

        let held: BTreeSet<&SlotId> = self
            .tags
            .values()
            .flat_map(|t| t.slots.iter())
            .chain(self.pool.iter())
            .collect();
        let fresh: Vec<SlotId> = self
            .live
            .keys()
            .filter(|id| !held.contains(id))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "granted slots admitted to pool");
        }
        self.pool.extend(fresh);
    }

    fn apply_releases(&mut self, outcome: &mut CommitOutcome) {
        for (id, preference) in std::mem::take(&mut self.releases) {
            let mut owned = self.pool.contains(&id);
            for bucket in self.tags.values_mut() {
                owned |= bucket.slots.remove(&id);
            }
            if !owned {
                continue;
            }
            self.pool.remove(&id);

            // Hard and leased releases never re-enter the pool.
            let evicted = preference.kind == PreferenceKind::Hard || preference.lease_secs > 0;
            let unrecoverable = self.live.get(&id).is_some_and(|s| s.unrecoverable);
            let pool_full = self.pool.len() >= self.config.max_pool as usize;
            if pool_full || unrecoverable || evicted {
                let preference = if unrecoverable {
                    ReleasePreference::hard()
                } else {
                    preference
                };
                outcome.to_release.push((id.clone(), preference));
                self.live.remove(&id);
            } else {
                self.pool.insert(id);
            }
        }
    }

    fn apply_targets(&mut self, now: u64) {
        for (name, target) in std::mem::take(&mut self.requests) {
            let bucket = self
                .tags
                .entry(name.clone())
                .or_insert_with(|| VirtualTag::new(name));
            if bucket.target != target {
                bucket.target = target;
                bucket.target_changed_at = now;
            }
        }
    }

    /// Move the lowest-scored excess slots of over-target buckets to the pool.
    fn shrink_buckets(&mut self) {
        for bucket in self.tags.values_mut() {
            let excess = bucket.slots.len().saturating_sub(bucket.target as usize);
            if excess == 0 {
                continue;
            }
            let held: Vec<&SlotInfo> = bucket
                .slots
                .iter()
                .filter_map(|id| self.live.get(id))
                .collect();
            let evict: Vec<SlotId> = rank_for_eviction(&held, &self.weights)
                .into_iter()
                .take(excess)
                .map(|s| s.id.clone())
                .collect();
            for id in evict {
                bucket.slots.remove(&id);
                self.pool.insert(id);
            }
        }
    }

    fn fill_buckets(&mut self, strategy: &dyn PlacementStrategy) -> usize {
        let mut assigned = 0;
        for bucket in self.tags.values_mut() {
            let short = bucket.shortfall();
            if short == 0 {
                continue;
            }
            let candidates: Vec<&SlotInfo> = self
                .pool
                .iter()
                .filter_map(|id| self.live.get(id))
                .filter(|s| !s.unrecoverable)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let current: Vec<&SlotInfo> = bucket
                .slots
                .iter()
                .filter_map(|id| self.live.get(id))
                .collect();
            for id in strategy.pick(&candidates, &current, short) {
                if self.pool.remove(&id) {
                    bucket.slots.insert(id);
                    assigned += 1;
                }
            }
        }
        assigned
    }

    /// Release unrecoverable pool slots, then trim to `max_pool` lowest score first.
    fn trim_pool(&mut self, outcome: &mut CommitOutcome) {
        let max = self.config.max_pool as usize;
        let pooled: Vec<&SlotInfo> = self
            .pool
            .iter()
            .filter_map(|id| self.live.get(id))
            .collect();
        let ranked = rank_for_eviction(&pooled, &self.weights);

        let mut evict: Vec<(SlotId, ReleasePreference)> = Vec::new();
        let mut remaining = self.pool.len();
        for slot in ranked {
            if slot.unrecoverable {
                evict.push((slot.id.clone(), ReleasePreference::hard()));
                remaining -= 1;
            } else if remaining > max {
                evict.push((slot.id.clone(), ReleasePreference::soft()));
                remaining -= 1;
            }
        }
        if !evict.is_empty() {
            info!(
                evicted = evict.len(),
                lowest_score = evict.first().and_then(|(id, _)| self.live.get(id)).map(|s| score_slot(s, &self.weights)),
                "pool trimmed"
            );
        }
        for (id, preference) in evict {
            self.pool.remove(&id);
            self.live.remove(&id);
            outcome.to_release.push((id, preference));
        }
    }
}
