//! redb table definitions for the fleetgrid state store.
//!
//! A single table holds every persisted document. Keys are slash-separated
//! paths (`groups/{group_id}`, `plans/index`, `buffer/state`) so related
//! documents can be listed by prefix.

use redb::TableDefinition;

/// JSON documents keyed by path.
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
