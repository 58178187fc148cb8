//! KGR Graph - Entity/relation store implementations
//!
//! Provides an in-memory implementation of the [`EntityStore`] contract,
//! used by tests, the CLI and small deployments, plus the snapshot format
//! it loads from.
//!
//! [`EntityStore`]: kgr_core::EntityStore

use kgr_core::{Entity, Relation};
use serde::{Deserialize, Serialize};

pub mod memory_store;

pub use memory_store::MemoryGraphStore;

/// A serialized graph: entities followed by the relations between them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub entities: Vec<Entity>,

    #[serde(default)]
    pub relations: Vec<Relation>,
}
