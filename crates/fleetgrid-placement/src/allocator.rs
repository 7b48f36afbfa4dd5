//! The cluster allocator contract.
//!
//! Every call is synchronous and takes `&self`; implementations guard their
//! own state. Roles use the per-tag calls, the group manager drives the
//! lifecycle hooks once per cycle.

use std::collections::BTreeSet;

use fleet_core::{ReleasePreference, ResourceRequest, SlotId, SlotInfo};
use fleet_core::config::BufferConfig;

use crate::error::PlacementResult;

pub trait ResourceAllocator: Send + Sync {
    /// False when the allocator's status is stale or it was stopped.
    fn is_working(&self) -> bool;
    fn start(&self);
    fn stop(&self);

    /// Called before a scheduling cycle touches any role.
    fn before_update(&self);
    /// Commits every request and release made during the cycle.
    fn after_update(&self) -> PlacementResult<()>;

    fn release_slot(&self, slot: &SlotId, preference: ReleasePreference);
    /// Give back every slot held under `tag` and forget its request.
    fn release_tag(&self, tag: &str);
    fn tags_in_use(&self) -> BTreeSet<String>;
    fn slots(&self, tag: &str) -> Vec<SlotInfo>;
    fn update_request(&self, tag: &str, request: ResourceRequest);

    fn app_checksum(&self) -> String;
    /// Reload whatever state the allocator persists.
    fn recover(&self) -> PlacementResult<()>;

    /// Warm-pool controls, if this allocator buffers slots.
    fn buffering(&self) -> Option<&dyn BufferControl> {
        None
    }
}

/// Controls exposed by a buffering allocator.
pub trait BufferControl: Send + Sync {
    fn buffer_config(&self) -> BufferConfig;
    fn set_buffer_config(&self, config: BufferConfig) -> PlacementResult<()>;
    /// Slots currently in the free pool.
    fn pooled_slots(&self) -> Vec<SlotId>;
}
