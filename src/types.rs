//! Core data types shared across the agent runtime
//!
//! Identifiers, memory items and the small value types that flow between the
//! mailbox, the capability checker and the memory subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Free-form metadata attached to messages and memories
pub type Metadata = HashMap<String, serde_json::Value>;

/// Unique identifier for memories
///
/// Wraps a UUID to provide type safety and prevent mixing memory IDs
/// with message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a memory ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for mailbox messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent identifier, chosen by whoever configures the session
pub type AgentId = String;

/// Memory type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Direct experience: conversations the agent took part in
    Episodic,

    /// Facts and knowledge, including what was learned from other agents
    Semantic,

    /// How-to knowledge
    Procedural,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Procedural,
    ];
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Episodic => write!(f, "episodic"),
            MemoryType::Semantic => write!(f, "semantic"),
            MemoryType::Procedural => write!(f, "procedural"),
        }
    }
}

/// A single memory owned by exactly one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    // === Identity ===
    /// Unique identifier
    pub id: MemoryId,

    /// Owning agent
    pub agent_id: AgentId,

    /// Memory type (also the type-index bucket the item lives in)
    pub memory_type: MemoryType,

    // === Content ===
    /// Memory content
    pub content: String,

    /// Embedding vector, when an embedding service produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Importance (0.0 - 1.0)
    pub importance: f32,

    // === Lifecycle ===
    /// Number of times this memory has been read
    pub access_count: u32,

    /// Last access timestamp
    pub last_access_time: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Free-form metadata (source agent, merge trail, ...)
    #[serde(default)]
    pub metadata: Metadata,
}

impl MemoryItem {
    /// Age in fractional days relative to `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }

    /// Hours since last access relative to `now`
    pub fn hours_since_access(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_access_time).num_seconds().max(0) as f64 / 3_600.0
    }
}

/// Input for creating a memory
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub content: String,
    pub importance: f32,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
}

impl NewMemory {
    pub fn new(memory_type: MemoryType, content: impl Into<String>, importance: f32) -> Self {
        Self {
            memory_type,
            content: content.into(),
            importance,
            embedding: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Updates to apply to an existing memory
#[derive(Debug, Default, Clone)]
pub struct MemoryUpdates {
    /// New content
    pub content: Option<String>,

    /// New importance (clamped to [0, 1])
    pub importance: Option<f32>,

    /// New access count
    pub access_count: Option<u32>,

    /// New last access time
    pub last_access_time: Option<DateTime<Utc>>,

    /// New embedding
    pub embedding: Option<Vec<f32>>,

    /// Metadata entries to merge in (existing keys are overwritten)
    pub metadata: Option<Metadata>,
}
