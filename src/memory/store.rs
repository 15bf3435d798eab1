//! Bounded, typed memory store for one agent
//!
//! Items live in a primary map keyed by [`MemoryId`] and in exactly one
//! type-index bucket. Every insert and delete goes through the private
//! `index`/`unindex` helpers so the two views never disagree.
//!
//! When an `add` pushes the store past `max_items`, the lowest-retention
//! items are evicted: at least 10% of the store, and always enough to get
//! back under capacity.

use crate::clock::Clock;
use crate::config::MemoryConfig;
use crate::error::{Result, RuntimeError};
use crate::types::{AgentId, MemoryId, MemoryItem, MemoryType, MemoryUpdates, NewMemory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Share of the store evicted when it overflows
const EVICTION_FRACTION: f64 = 0.1;

/// Summary of store contents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub procedural: usize,
    pub average_importance: f32,
    pub total_access_count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// In-memory store owned by one agent
#[derive(Debug)]
pub struct MemoryStore {
    agent_id: AgentId,
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    items: HashMap<MemoryId, MemoryItem>,
    by_type: HashMap<MemoryType, HashSet<MemoryId>>,
    // insertion sequence, breaks created_at ties
    sequence: HashMap<MemoryId, u64>,
    next_sequence: u64,
}

impl MemoryStore {
    pub fn new(agent_id: impl Into<AgentId>, config: MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            clock,
            items: HashMap::new(),
            by_type: HashMap::new(),
            sequence: HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Store a new memory, evicting low-retention items if over capacity
    pub fn add(&mut self, memory: NewMemory) -> MemoryItem {
        let now = self.clock.now();
        let item = MemoryItem {
            id: MemoryId::new(),
            agent_id: self.agent_id.clone(),
            memory_type: memory.memory_type,
            content: memory.content,
            embedding: memory.embedding,
            importance: memory.importance.clamp(0.0, 1.0),
            access_count: 0,
            last_access_time: now,
            created_at: now,
            metadata: memory.metadata,
        };

        tracing::debug!(
            "Agent {} stored {} memory {}",
            self.agent_id,
            item.memory_type,
            item.id
        );
        self.index(item.clone());

        if self.items.len() > self.config.max_items {
            self.evict(now);
        }
        item
    }

    /// Read a memory, counting the access
    pub fn get(&mut self, id: &MemoryId) -> Option<MemoryItem> {
        let now = self.clock.now();
        let item = self.items.get_mut(id)?;
        item.access_count = item.access_count.saturating_add(1);
        item.last_access_time = now;
        Some(item.clone())
    }

    /// Read a memory without touching its access stats
    pub fn peek(&self, id: &MemoryId) -> Option<&MemoryItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.items.contains_key(id)
    }

    pub fn update(&mut self, id: &MemoryId, updates: MemoryUpdates) -> Result<MemoryItem> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RuntimeError::MemoryNotFound(id.to_string()))?;

        if let Some(content) = updates.content {
            item.content = content;
        }
        if let Some(importance) = updates.importance {
            item.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(access_count) = updates.access_count {
            item.access_count = access_count;
        }
        if let Some(last_access_time) = updates.last_access_time {
            item.last_access_time = last_access_time;
        }
        if let Some(embedding) = updates.embedding {
            item.embedding = Some(embedding);
        }
        if let Some(metadata) = updates.metadata {
            item.metadata.extend(metadata);
        }
        Ok(item.clone())
    }

    /// Drop a memory's embedding so it no longer takes part in vector search
    pub fn clear_embedding(&mut self, id: &MemoryId) -> bool {
        match self.items.get_mut(id) {
            Some(item) => item.embedding.take().is_some(),
            None => false,
        }
    }

    pub fn delete(&mut self, id: &MemoryId) -> Option<MemoryItem> {
        self.unindex(id)
    }

    /// Memories of one type, oldest first
    pub fn get_by_type(&self, memory_type: MemoryType) -> Vec<MemoryItem> {
        let mut items: Vec<&MemoryItem> = self
            .by_type
            .get(&memory_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
            .collect();
        self.sort_oldest_first(&mut items);
        items.into_iter().cloned().collect()
    }

    /// Every memory, oldest first
    pub fn get_all(&self) -> Vec<MemoryItem> {
        let mut items: Vec<&MemoryItem> = self.items.values().collect();
        self.sort_oldest_first(&mut items);
        items.into_iter().cloned().collect()
    }

    /// The `n` most recently created memories, newest first
    pub fn get_recent(&self, n: usize) -> Vec<MemoryItem> {
        let mut items: Vec<&MemoryItem> = self.items.values().collect();
        self.sort_oldest_first(&mut items);
        items.into_iter().rev().take(n).cloned().collect()
    }

    /// The `n` most important memories, most important first
    pub fn get_most_important(&self, n: usize) -> Vec<MemoryItem> {
        let mut items: Vec<&MemoryItem> = self.items.values().collect();
        self.sort_oldest_first(&mut items);
        items.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        items.into_iter().take(n).cloned().collect()
    }

    /// Bump access stats of several memories at once
    pub fn record_access(&mut self, ids: &[MemoryId]) {
        let now = self.clock.now();
        for id in ids {
            if let Some(item) = self.items.get_mut(id) {
                item.access_count = item.access_count.saturating_add(1);
                item.last_access_time = now;
            }
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.by_type.clear();
        self.sequence.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> MemoryStats {
        let count = |memory_type: MemoryType| self.by_type.get(&memory_type).map_or(0, HashSet::len);
        let total = self.items.len();
        let importance_sum: f32 = self.items.values().map(|item| item.importance).sum();

        MemoryStats {
            total,
            episodic: count(MemoryType::Episodic),
            semantic: count(MemoryType::Semantic),
            procedural: count(MemoryType::Procedural),
            average_importance: if total == 0 {
                0.0
            } else {
                importance_sum / total as f32
            },
            total_access_count: self
                .items
                .values()
                .map(|item| u64::from(item.access_count))
                .sum(),
            oldest: self.items.values().map(|item| item.created_at).min(),
            newest: self.items.values().map(|item| item.created_at).max(),
        }
    }

    /// Retention score; lower scores are evicted first
    ///
    /// `importance*0.4 + ln(access+1)*0.3 - age_days*decay - hours_idle*0.001`
    pub fn retention_score(&self, item: &MemoryItem, now: DateTime<Utc>) -> f64 {
        f64::from(item.importance) * 0.4 + (f64::from(item.access_count) + 1.0).ln() * 0.3
            - item.age_days(now) * f64::from(self.config.decay_rate)
            - item.hours_since_access(now) * 0.001
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let len = self.items.len();
        let tenth = (len as f64 * EVICTION_FRACTION).ceil() as usize;
        let count = tenth.max(len.saturating_sub(self.config.max_items));

        let mut ranked: Vec<(f64, MemoryId)> = self
            .items
            .values()
            .map(|item| (self.retention_score(item, now), item.id))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, id) in ranked.into_iter().take(count) {
            self.unindex(&id);
        }

        tracing::info!(
            "Agent {} memory over capacity ({} > {}), evicted {}",
            self.agent_id,
            len,
            self.config.max_items,
            count
        );
    }

    fn index(&mut self, item: MemoryItem) {
        self.by_type
            .entry(item.memory_type)
            .or_default()
            .insert(item.id);
        self.sequence.insert(item.id, self.next_sequence);
        self.next_sequence += 1;
        self.items.insert(item.id, item);
    }

    fn unindex(&mut self, id: &MemoryId) -> Option<MemoryItem> {
        let item = self.items.remove(id)?;
        if let Some(bucket) = self.by_type.get_mut(&item.memory_type) {
            bucket.remove(id);
        }
        self.sequence.remove(id);
        Some(item)
    }

    fn sort_oldest_first(&self, items: &mut [&MemoryItem]) {
        items.sort_by_key(|item| (item.created_at, self.sequence.get(&item.id).copied()));
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let indexed: usize = self.by_type.values().map(HashSet::len).sum();
        indexed == self.items.len()
            && self.items.values().all(|item| {
                self.by_type
                    .get(&item.memory_type)
                    .is_some_and(|bucket| bucket.contains(&item.id))
            })
    }
}
