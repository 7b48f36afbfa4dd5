//! fleetgrid-proxy — dual-backend routing for staged migrations.
//!
//! While groups move from the local scheduler to another backend, every
//! plan mutation and status read goes through the [`Router`], which decides
//! per group how much of each plan each backend receives.
//!
//! # Components
//!
//! - **`router`** — ratio resolution, count rewriting, write ordering and
//!   status merging
//! - **`client`** — the [`ProxyClient`] and [`LocalBackend`] seams

pub mod client;
pub mod error;
pub mod router;

pub use client::{LocalBackend, ProxyClient};
pub use error::{RouterError, RouterResult};
pub use router::{ROUTER_KEY, Ratios, Router, merge_status, rewrite_counts};
