//! LocalAllocator — an in-process cluster of `nodes × slots_per_node` slots.
//!
//! Backs `fleetd` in standalone mode and the end-to-end tests. Requests are
//! granted on `after_update`, spreading new grants across nodes. The
//! allocator reports itself down when its last refresh is older than
//! `stale_after` or after `stop`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fleet_core::{PreferenceKind, ReleasePreference, ResourceRequest, SlotId, SlotInfo};
use tracing::{debug, info, warn};

use crate::allocator::ResourceAllocator;
use crate::error::{PlacementError, PlacementResult};

struct Cluster {
    running: bool,
    last_refresh: Option<Instant>,
    slots: BTreeMap<SlotId, SlotInfo>,
    /// Slot → owning tag.
    owner: BTreeMap<SlotId, String>,
    requests: BTreeMap<String, u32>,
    /// Hard-released slots and when they may be granted again.
    quarantine: BTreeMap<SlotId, Option<Instant>>,
}

pub struct LocalAllocator {
    cluster: Mutex<Cluster>,
    stale_after: Duration,
    checksum: String,
}

impl LocalAllocator {
    pub fn new(nodes: u32, slots_per_node: u32, stale_after: Duration) -> Self {
        let mut slots = BTreeMap::new();
        for node in 0..nodes {
            for index in 0..slots_per_node {
                let id = SlotId::new(format!("node-{node}"), index);
                slots.insert(
                    id.clone(),
                    SlotInfo {
                        id,
                        package_installed: false,
                        process_running: false,
                        unrecoverable: false,
                    },
                );
            }
        }
        Self {
            cluster: Mutex::new(Cluster {
                running: false,
                last_refresh: None,
                slots,
                owner: BTreeMap::new(),
                requests: BTreeMap::new(),
                quarantine: BTreeMap::new(),
            }),
            stale_after,
            checksum: format!("local-{nodes}x{slots_per_node}"),
        }
    }

    /// Record a successful status refresh.
    pub fn refresh(&self) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        if cluster.running {
            cluster.last_refresh = Some(Instant::now());
        }
    }

    /// Flag a slot as given up on; owners see it on their next read.
    pub fn mark_unrecoverable(&self, slot: &SlotId) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        if let Some(info) = cluster.slots.get_mut(slot) {
            info.unrecoverable = true;
            warn!(%slot, "slot marked unrecoverable");
        }
    }

    /// Number of slots currently granted to any tag.
    pub fn granted(&self) -> usize {
        self.cluster.lock().expect("cluster lock").owner.len()
    }

    fn grant(cluster: &mut Cluster, now: Instant) {
        cluster
            .quarantine
            .retain(|_, until| until.is_none_or(|t| t > now));

        let mut free: Vec<SlotId> = cluster
            .slots
            .iter()
            .filter(|(id, info)| {
                !info.unrecoverable
                    && !cluster.owner.contains_key(*id)
                    && !cluster.quarantine.contains_key(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        // Spread: first slot of every node, then the second, and so on.
        free.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.node.cmp(&b.node)));
        let mut free = free.into_iter();

        let requests: Vec<(String, u32)> = cluster
            .requests
            .iter()
            .map(|(tag, count)| (tag.clone(), *count))
            .collect();
        for (tag, count) in requests {
            let held = cluster.owner.values().filter(|t| **t == tag).count() as u32;
            let mut granted = 0;
            for _ in held..count {
                let Some(id) = free.next() else {
                    warn!(%tag, missing = count - held - granted, "cluster out of slots");
                    break;
                };
                if let Some(info) = cluster.slots.get_mut(&id) {
                    info.package_installed = true;
                    info.process_running = true;
                }
                cluster.owner.insert(id, tag.clone());
                granted += 1;
            }
            if granted > 0 {
                debug!(%tag, granted, "slots granted");
            }
        }
    }
}

impl ResourceAllocator for LocalAllocator {
    fn is_working(&self) -> bool {
        let cluster = self.cluster.lock().expect("cluster lock");
        cluster.running
            && cluster
                .last_refresh
                .is_some_and(|t| t.elapsed() < self.stale_after)
    }

    fn start(&self) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        cluster.running = true;
        cluster.last_refresh = Some(Instant::now());
        info!(slots = cluster.slots.len(), "local allocator started");
    }

    fn stop(&self) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        cluster.running = false;
        info!("local allocator stopped");
    }

    fn before_update(&self) {}

    fn after_update(&self) -> PlacementResult<()> {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        if !cluster.running {
            return Err(PlacementError::Unavailable("local allocator stopped".to_string()));
        }
        let now = Instant::now();
        Self::grant(&mut cluster, now);
        cluster.last_refresh = Some(now);
        Ok(())
    }

    fn release_slot(&self, slot: &SlotId, preference: ReleasePreference) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        if cluster.owner.remove(slot).is_none() {
            return;
        }
        if let Some(info) = cluster.slots.get_mut(slot) {
            info.package_installed = false;
            info.process_running = false;
        }
        if preference.kind == PreferenceKind::Hard {
            let until = (preference.lease_secs > 0)
                .then(|| Instant::now() + Duration::from_secs(preference.lease_secs));
            cluster.quarantine.insert(slot.clone(), until);
        }
        debug!(%slot, ?preference, "slot released");
    }

    fn release_tag(&self, tag: &str) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        cluster.requests.remove(tag);
        let before = cluster.owner.len();
        cluster.owner.retain(|_, owner| owner.as_str() != tag);
        debug!(tag, released = before - cluster.owner.len(), "tag released");
    }

    fn tags_in_use(&self) -> BTreeSet<String> {
        let cluster = self.cluster.lock().expect("cluster lock");
        cluster
            .requests
            .keys()
            .chain(cluster.owner.values())
            .cloned()
            .collect()
    }

    fn slots(&self, tag: &str) -> Vec<SlotInfo> {
        let cluster = self.cluster.lock().expect("cluster lock");
        cluster
            .owner
            .iter()
            .filter(|(_, owner)| *owner == tag)
            .filter_map(|(id, _)| cluster.slots.get(id).cloned())
            .collect()
    }

    fn update_request(&self, tag: &str, request: ResourceRequest) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        cluster.requests.insert(tag.to_string(), request.count);
    }

    fn app_checksum(&self) -> String {
        self.checksum.clone()
    }

    fn recover(&self) -> PlacementResult<()> {
        Ok(())
    }
}
