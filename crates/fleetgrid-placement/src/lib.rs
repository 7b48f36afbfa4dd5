//! fleetgrid slot allocation — allocator contract, warm pool, placement.
//!
//! Roles ask for slots by tag through [`ResourceAllocator`]. The
//! [`BufferedAllocator`] sits in front of the cluster allocator and keeps a
//! warm pool of spare slots, so a role that needs more instances is served
//! from the pool in the same cycle instead of waiting for the cluster.
//!
//! # Components
//!
//! - **`allocator`** — `ResourceAllocator` contract and the `BufferControl` capability
//! - **`scorer`** — slot health scoring, default and scatter placement
//! - **`buffer`** — `SlotsBuffer`: demand buckets plus free pool
//! - **`buffered`** — `BufferedAllocator`: the buffer wired to a cluster allocator
//! - **`sim`** — `LocalAllocator`: in-process cluster for standalone runs and tests

pub mod allocator;
pub mod buffer;
pub mod buffered;
pub mod error;
pub mod scorer;
pub mod sim;

pub use allocator::{BufferControl, ResourceAllocator};
pub use buffer::{BufferState, CommitOutcome, SlotsBuffer, VirtualTag};
pub use buffered::{BUFFER_KEY, BufferedAllocator, CLUSTER_TAG};
pub use error::{PlacementError, PlacementResult};
pub use scorer::{
    DefaultPlacement, PlacementStrategy, ScatterPlacement, ScoringWeights, placement_for,
    rank_for_eviction, score_slot,
};
pub use sim::LocalAllocator;
