//! fleet-core — shared types for the fleetgrid control plane.
//!
//! Everything that crosses a crate boundary lives here: group and role
//! plans, status snapshots, slot identifiers, plan hashing, error codes,
//! and the `fleetd.toml` configuration.

pub mod config;
pub mod error;
pub mod slot;
pub mod status;
pub mod types;
pub mod version;

pub use config::FleetConfig;
pub use error::ErrorCode;
pub use slot::*;
pub use status::*;
pub use types::*;
pub use version::{CompatPlanHasher, DefaultPlanHasher, PlanHasher};
