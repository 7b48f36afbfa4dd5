//! fleetgrid-state — persistence for the fleetgrid control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Every component persists whole
//! JSON documents under string keys through the [`Persistence`] trait:
//!
//! | Key             | Owner              |
//! |-----------------|--------------------|
//! | `plans/index`   | `GroupPlanManager` |
//! | `groups/{id}`   | group runtime data |
//! | `buffer/state`  | buffered allocator |
//! | `router/config` | migration router   |
//!
//! Writes go through [`DiffWriter`], which skips a write when the encoded
//! document is byte-identical to the last one that succeeded.

pub mod error;
pub mod persistence;
pub mod plans;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use persistence::{DiffWriter, Persistence, read_json};
pub use plans::{GroupPlanManager, MAX_EXTRA_RATIO, PLANS_KEY};
pub use store::StateStore;
