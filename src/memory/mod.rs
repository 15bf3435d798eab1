//! Agent memory: storage, retrieval and consolidation
//!
//! Each agent owns one [`MemoryStore`] behind a [`SharedMemory`] lock. The
//! mailbox loop, the consolidation timer, knowledge absorption and autonomous
//! thinking all go through that lock, so store mutations are serialized per
//! agent.

pub mod consolidation;
pub mod retrieval;
pub mod store;
pub mod text;

pub use consolidation::{ConsolidationResult, MemoryConsolidation, MERGED_FROM_KEY};
pub use retrieval::{MemoryRetrieval, RetrievalOptions, ScoredMemory};
pub use store::{MemoryStats, MemoryStore};

use std::sync::Arc;
use tokio::sync::RwLock;

/// A memory store shared between an agent's tasks
pub type SharedMemory = Arc<RwLock<MemoryStore>>;

/// Wrap a store for sharing
pub fn shared(store: MemoryStore) -> SharedMemory {
    Arc::new(RwLock::new(store))
}
