//! Slot identifiers and allocator request types.
//!
//! Slots are owned by the cluster allocator. The control plane copies and
//! indexes them but never invents one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single allocated slot: the node plus a per-node index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub node: String,
    pub index: u32,
}

impl SlotId {
    pub fn new(node: impl Into<String>, index: u32) -> Self {
        Self {
            node: node.into(),
            index,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.index)
    }
}

/// Live view of a slot as reported by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: SlotId,
    /// Whether the role's package is already installed on the slot.
    pub package_installed: bool,
    pub process_running: bool,
    /// The allocator gave up on this slot.
    pub unrecoverable: bool,
}

impl SlotInfo {
    /// Physical node hosting the slot.
    pub fn node(&self) -> &str {
        &self.id.node
    }
}

/// How strongly the allocator should avoid handing a released slot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceKind {
    #[default]
    None,
    Soft,
    Hard,
}

/// Release preference with an optional lease in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReleasePreference {
    pub kind: PreferenceKind,
    #[serde(default)]
    pub lease_secs: u64,
}

impl ReleasePreference {
    pub fn soft() -> Self {
        Self {
            kind: PreferenceKind::Soft,
            lease_secs: 0,
        }
    }

    pub fn hard() -> Self {
        Self {
            kind: PreferenceKind::Hard,
            lease_secs: 0,
        }
    }
}

/// Aggregate request for one resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub count: u32,
}

impl ResourceRequest {
    pub fn count(count: u32) -> Self {
        Self { count }
    }
}
