//! "Persist one record" collaborator
//!
//! The runtime offers every memory and thought it produces to an optional
//! [`RecordSink`]. Durability is whatever the sink provides; failures are
//! logged by the caller and never block the agent.

use crate::error::Result;
use crate::thinking::ThinkingTask;
use crate::types::MemoryItem;
use async_trait::async_trait;
use serde::Serialize;

/// A record handed to the persistence collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum PersistRecord {
    Memory(MemoryItem),
    Thought(ThinkingTask),
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist(&self, record: &PersistRecord) -> Result<()>;
}
