//! BufferedAllocator — a warm pool in front of the cluster allocator.
//!
//! Roles see the usual per-tag interface. Underneath, every slot is held
//! under one cluster tag and handed out to the roles' buckets by the
//! [`SlotsBuffer`]. A commit runs in two phases: the write lock covers the
//! buffer computation, then a read lock covers building and submitting the
//! single cluster request. The phases are not atomic together; anything
//! that changes in between is picked up by the next commit.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::config::BufferConfig;
use fleet_core::{ReleasePreference, ResourceRequest, SlotId, SlotInfo};
use fleetgrid_state::{DiffWriter, Persistence, read_json};
use tracing::{debug, info, warn};

use crate::allocator::{BufferControl, ResourceAllocator};
use crate::buffer::{BufferState, SlotsBuffer};
use crate::error::{PlacementError, PlacementResult};
use crate::scorer::placement_for;

/// Key of the persisted bucket table and config.
pub const BUFFER_KEY: &str = "buffer/state";

/// Tag under which the buffer holds every slot in the cluster.
pub const CLUSTER_TAG: &str = "__buffer__";

pub struct BufferedAllocator {
    inner: Arc<dyn ResourceAllocator>,
    store: Arc<dyn Persistence>,
    buffer: RwLock<SlotsBuffer>,
    writer: Mutex<DiffWriter>,
}

impl BufferedAllocator {
    pub fn new(
        inner: Arc<dyn ResourceAllocator>,
        store: Arc<dyn Persistence>,
        config: BufferConfig,
    ) -> PlacementResult<Self> {
        check_config(&config)?;
        Ok(Self {
            inner,
            store,
            buffer: RwLock::new(SlotsBuffer::new(config)),
            writer: Mutex::new(DiffWriter::new(BUFFER_KEY)),
        })
    }

    fn persist(&self, state: &BufferState) -> PlacementResult<()> {
        let mut writer = self.writer.lock().expect("buffer writer lock");
        writer.write(self.store.as_ref(), state)?;
        Ok(())
    }
}

impl ResourceAllocator for BufferedAllocator {
    fn is_working(&self) -> bool {
        self.inner.is_working()
    }

    fn start(&self) {
        self.inner.start();
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn before_update(&self) {
        self.inner.before_update();
    }

    fn after_update(&self) -> PlacementResult<()> {
        let live = self.inner.slots(CLUSTER_TAG);

        // Phase one: fold the cycle into the buffer.
        let outcome = {
            let mut buffer = self.buffer.write().expect("buffer lock");
            let strategy = placement_for(buffer.config().placement, buffer.config().node_penalty);
            buffer.commit(live, epoch_secs(), strategy.as_ref())
        };
        for (slot, preference) in &outcome.to_release {
            self.inner.release_slot(slot, *preference);
        }

        // Phase two: one combined request, then persist the bucket table.
        let (request, state) = {
            let buffer = self.buffer.read().expect("buffer lock");
            (buffer.combined_request(), buffer.state())
        };
        self.inner
            .update_request(CLUSTER_TAG, ResourceRequest::count(request));
        debug!(request, released = outcome.to_release.len(), "buffer request submitted");

        if let Err(e) = self.persist(&state) {
            warn!(error = %e, "buffer state not persisted");
        }
        self.inner.after_update()
    }

    fn release_slot(&self, slot: &SlotId, preference: ReleasePreference) {
        let mut buffer = self.buffer.write().expect("buffer lock");
        buffer.release_slot(slot.clone(), preference);
    }

    fn release_tag(&self, tag: &str) {
        let mut buffer = self.buffer.write().expect("buffer lock");
        buffer.release_tag(tag);
    }

    fn tags_in_use(&self) -> BTreeSet<String> {
        self.buffer.read().expect("buffer lock").tag_names()
    }

    fn slots(&self, tag: &str) -> Vec<SlotInfo> {
        self.buffer.read().expect("buffer lock").slots(tag)
    }

    fn update_request(&self, tag: &str, request: ResourceRequest) {
        let mut buffer = self.buffer.write().expect("buffer lock");
        buffer.request(tag, request.count);
    }

    fn app_checksum(&self) -> String {
        self.inner.app_checksum()
    }

    fn recover(&self) -> PlacementResult<()> {
        self.inner.recover()?;
        let Some(state) = read_json::<BufferState>(self.store.as_ref(), BUFFER_KEY)? else {
            return Ok(());
        };
        check_config(&state.config)?;
        let bytes = DiffWriter::encode(&state)?;
        info!(buckets = state.tags.len(), "buffer state recovered");
        *self.buffer.write().expect("buffer lock") = SlotsBuffer::restore(state);
        *self.writer.lock().expect("buffer writer lock") = DiffWriter::new(BUFFER_KEY).with_last(bytes);
        Ok(())
    }

    fn buffering(&self) -> Option<&dyn BufferControl> {
        Some(self)
    }
}

impl BufferControl for BufferedAllocator {
    fn buffer_config(&self) -> BufferConfig {
        self.buffer.read().expect("buffer lock").config().clone()
    }

    fn set_buffer_config(&self, config: BufferConfig) -> PlacementResult<()> {
        check_config(&config)?;
        let state = {
            let mut buffer = self.buffer.write().expect("buffer lock");
            let previous = buffer.config().clone();
            buffer.set_config(config);
            let state = buffer.state();
            if let Err(e) = self.persist(&state) {
                buffer.set_config(previous);
                return Err(e);
            }
            state
        };
        info!(
            min_pool = state.config.min_pool,
            max_pool = state.config.max_pool,
            placement = ?state.config.placement,
            "buffer config updated"
        );
        Ok(())
    }

    fn pooled_slots(&self) -> Vec<SlotId> {
        self.buffer
            .read()
            .expect("buffer lock")
            .pool()
            .iter()
            .cloned()
            .collect()
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn check_config(config: &BufferConfig) -> PlacementResult<()> {
    if config.min_pool > config.max_pool {
        return Err(PlacementError::InvalidConfig(format!(
            "min_pool {} exceeds max_pool {}",
            config.min_pool, config.max_pool
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LocalAllocator;
    use fleet_core::config::PlacementKind;
    use fleetgrid_state::StateStore;
    use std::time::Duration;

    fn setup(min_pool: u32, max_pool: u32) -> (Arc<LocalAllocator>, BufferedAllocator, StateStore) {
        let cluster = Arc::new(LocalAllocator::new(3, 4, Duration::from_secs(60)));
        cluster.start();
        let store = StateStore::open_in_memory().unwrap();
        let config = BufferConfig {
            enabled: true,
            min_pool,
            max_pool,
            placement: PlacementKind::Scatter,
            ..BufferConfig::default()
        };
        let buffered = BufferedAllocator::new(cluster.clone(), Arc::new(store.clone()), config).unwrap();
        (cluster, buffered, store)
    }

    #[test]
    fn requests_served_after_cluster_grant() {
        let (_, buffered, _) = setup(2, 8);
        buffered.update_request("g1.web", ResourceRequest::count(3));

        // First commit asks the cluster; second moves the grant into the bucket.
        buffered.after_update().unwrap();
        buffered.after_update().unwrap();

        let slots = buffered.slots("g1.web");
        assert_eq!(slots.len(), 3);
        let nodes: BTreeSet<&str> = slots.iter().map(|s| s.node()).collect();
        assert_eq!(nodes.len(), 3, "scatter spreads across nodes");
        assert_eq!(buffered.pooled_slots().len(), 2);
    }

    #[test]
    fn no_slot_both_assigned_and_pooled() {
        let (_, buffered, _) = setup(1, 4);
        buffered.update_request("a", ResourceRequest::count(2));
        buffered.update_request("b", ResourceRequest::count(2));
        for _ in 0..3 {
            buffered.after_update().unwrap();
        }
        buffered.update_request("a", ResourceRequest::count(0));
        buffered.update_request("b", ResourceRequest::count(4));
        buffered.after_update().unwrap();

        let pooled: BTreeSet<SlotId> = buffered.pooled_slots().into_iter().collect();
        for tag in ["a", "b"] {
            for slot in buffered.slots(tag) {
                assert!(!pooled.contains(&slot.id));
            }
        }
        assert_eq!(buffered.slots("b").len(), 4);
    }

    #[test]
    fn state_persisted_only_on_change() {
        let (_, buffered, store) = setup(0, 4);
        buffered.update_request("t", ResourceRequest::count(1));
        buffered.after_update().unwrap();
        buffered.after_update().unwrap();
        assert!(store.exists(BUFFER_KEY).unwrap());

        let before = store.read(BUFFER_KEY).unwrap();
        buffered.after_update().unwrap();
        assert_eq!(store.read(BUFFER_KEY).unwrap(), before);
    }

    #[test]
    fn recover_restores_buckets() {
        let (cluster, buffered, store) = setup(0, 4);
        buffered.update_request("t", ResourceRequest::count(2));
        buffered.after_update().unwrap();
        buffered.after_update().unwrap();
        let owned: BTreeSet<SlotId> = buffered.slots("t").into_iter().map(|s| s.id).collect();

        let restarted = BufferedAllocator::new(cluster, Arc::new(store), BufferConfig::default()).unwrap();
        restarted.recover().unwrap();
        assert_eq!(restarted.buffer_config().max_pool, 4);
        restarted.after_update().unwrap();
        let again: BTreeSet<SlotId> = restarted.slots("t").into_iter().map(|s| s.id).collect();
        assert_eq!(again, owned);
    }

    #[test]
    fn buffering_capability_exposed() {
        let (cluster, buffered, _) = setup(0, 4);
        assert!(cluster.buffering().is_none());
        let control = buffered.buffering().unwrap();
        assert!(control.set_buffer_config(BufferConfig {
            min_pool: 5,
            max_pool: 2,
            ..BufferConfig::default()
        })
        .is_err());
        assert_eq!(control.buffer_config().max_pool, 4);
    }

    #[test]
    fn inverted_pool_bounds_rejected_at_construction() {
        let cluster = Arc::new(LocalAllocator::new(1, 1, Duration::from_secs(60)));
        let store = StateStore::open_in_memory().unwrap();
        let config = BufferConfig {
            enabled: true,
            min_pool: 3,
            max_pool: 1,
            ..BufferConfig::default()
        };
        let err = BufferedAllocator::new(cluster, Arc::new(store), config).err().unwrap();
        assert!(matches!(err, PlacementError::InvalidConfig(_)));
    }
}
