//! Background memory consolidation
//!
//! One run is three passes over an agent's store:
//! 1. merge near-duplicate memories of the same type
//! 2. prune old memories that were rarely accessed
//! 3. strengthen memories that are accessed often
//!
//! Merged content is computed without holding the store lock (the optional
//! summarizer and embedder may be slow); the merge is applied afterwards only
//! if every cluster member still exists. A merged memory carries an embedding
//! of its new content, or none at all when no embedder is configured.

use crate::clock::Clock;
use crate::config::ConsolidationConfig;
use crate::embeddings::EmbeddingService;
use crate::memory::text::{jaccard, token_set};
use crate::memory::SharedMemory;
use crate::services::Summarizer;
use crate::types::{MemoryId, MemoryItem, MemoryType, MemoryUpdates, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Access count above which a memory is strengthened
const STRENGTHEN_MIN_ACCESS: u32 = 10;
/// Importance below which a memory is still eligible for strengthening
const STRENGTHEN_CEILING: f32 = 0.9;
const STRENGTHEN_STEP: f32 = 0.05;
/// Importance multiplier applied to a merged memory
const MERGE_BOOST: f32 = 1.1;

/// Metadata key holding the ids absorbed into a merged memory
pub const MERGED_FROM_KEY: &str = "mergedFrom";

/// Counts from one consolidation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationResult {
    /// Memories removed by merging into a cluster head
    pub merged: usize,
    pub pruned: usize,
    pub strengthened: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

struct MergePlan {
    head: MemoryId,
    absorbed: Vec<MemoryId>,
    updates: MemoryUpdates,
}

/// Merge/prune/strengthen job for one agent's store
#[derive(Clone)]
pub struct MemoryConsolidation {
    config: ConsolidationConfig,
    memory: SharedMemory,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    clock: Arc<dyn Clock>,
    last_result: Arc<Mutex<Option<ConsolidationResult>>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryConsolidation {
    pub fn new(
        config: ConsolidationConfig,
        memory: SharedMemory,
        summarizer: Option<Arc<dyn Summarizer>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            memory,
            summarizer,
            embedder: None,
            clock,
            last_result: Arc::new(Mutex::new(None)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Embedder used to refresh the embedding of merged memories
    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingService>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Run all three passes once
    pub async fn consolidate(&self) -> ConsolidationResult {
        let merged = self.merge_pass().await;

        let mut store = self.memory.write().await;
        let now = self.clock.now();

        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or(chrono::Duration::MAX);
        let stale: Vec<MemoryId> = store
            .get_all()
            .into_iter()
            .filter(|item| {
                now - item.created_at > max_age
                    && item.access_count < self.config.min_access_for_retention
            })
            .map(|item| item.id)
            .collect();
        for id in &stale {
            store.delete(id);
        }

        let mut strengthened = 0;
        for item in store.get_all() {
            if item.access_count > STRENGTHEN_MIN_ACCESS && item.importance < STRENGTHEN_CEILING {
                let updates = MemoryUpdates {
                    importance: Some((item.importance + STRENGTHEN_STEP).min(1.0)),
                    ..Default::default()
                };
                if store.update(&item.id, updates).is_ok() {
                    strengthened += 1;
                }
            }
        }
        drop(store);

        let result = ConsolidationResult {
            merged,
            pruned: stale.len(),
            strengthened,
            completed_at: Some(now),
        };
        tracing::info!(
            "Consolidation complete: merged {}, pruned {}, strengthened {}",
            result.merged,
            result.pruned,
            result.strengthened
        );
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        result
    }

    /// Start the periodic loop; returns false if disabled or already running
    pub fn start(&self) -> bool {
        if !self.config.enabled {
            tracing::debug!("Consolidation disabled");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; consolidation not started");
            return false;
        };

        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return false;
        }

        let job = self.clone();
        let period = self.config.interval;
        *handle = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                job.consolidate().await;
            }
        }));
        tracing::info!("Consolidation scheduled every {:?}", period);
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            tracing::info!("Consolidation stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn last_result(&self) -> Option<ConsolidationResult> {
        self.last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn merge_pass(&self) -> usize {
        let snapshot: Vec<Vec<MemoryItem>> = {
            let store = self.memory.read().await;
            MemoryType::ALL
                .iter()
                .map(|memory_type| store.get_by_type(*memory_type))
                .collect()
        };

        let mut plans = Vec::new();
        for items in snapshot {
            for cluster in cluster_similar(&items, self.config.similarity_threshold) {
                plans.push(self.plan_merge(&cluster).await);
            }
        }
        if plans.is_empty() {
            return 0;
        }

        let mut store = self.memory.write().await;
        let mut merged = 0;
        for plan in plans {
            let intact = store.contains(&plan.head)
                && plan.absorbed.iter().all(|id| store.contains(id));
            if !intact {
                tracing::debug!("Skipping merge into {}: cluster changed", plan.head);
                continue;
            }
            // the old vector describes the pre-merge content
            store.clear_embedding(&plan.head);
            if store.update(&plan.head, plan.updates).is_err() {
                continue;
            }
            for id in &plan.absorbed {
                store.delete(id);
            }
            merged += plan.absorbed.len();
        }
        merged
    }

    async fn plan_merge(&self, cluster: &[&MemoryItem]) -> MergePlan {
        let joined = cluster
            .iter()
            .map(|item| item.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let content = match &self.summarizer {
            Some(summarizer) if cluster.len() > 2 => match summarizer.summarize(&joined).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Summarizer failed, concatenating cluster: {}", e);
                    joined
                }
            },
            _ => joined,
        };

        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&content).await {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    tracing::warn!("Failed to embed merged memory: {}", e);
                    None
                }
            },
            None => None,
        };

        let head = cluster[0];
        let absorbed: Vec<MemoryId> = cluster[1..].iter().map(|item| item.id).collect();

        let average =
            cluster.iter().map(|item| item.importance).sum::<f32>() / cluster.len() as f32;
        let access_count = cluster
            .iter()
            .fold(0u32, |sum, item| sum.saturating_add(item.access_count));
        let last_access_time = cluster
            .iter()
            .map(|item| item.last_access_time)
            .max()
            .unwrap_or(head.last_access_time);

        let mut trail: Vec<serde_json::Value> = head
            .metadata
            .get(MERGED_FROM_KEY)
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default();
        trail.extend(
            absorbed
                .iter()
                .map(|id| serde_json::Value::String(id.to_string())),
        );
        let mut metadata = Metadata::new();
        metadata.insert(MERGED_FROM_KEY.to_string(), serde_json::Value::Array(trail));

        MergePlan {
            head: head.id,
            absorbed,
            updates: MemoryUpdates {
                content: Some(content),
                importance: Some((average * MERGE_BOOST).min(1.0)),
                access_count: Some(access_count),
                last_access_time: Some(last_access_time),
                embedding,
                metadata: Some(metadata),
            },
        }
    }
}

/// Single-link clusters of size > 1, built in scan order
///
/// An item joins the first existing cluster containing any member at or above
/// `threshold`; otherwise it starts a new cluster.
fn cluster_similar(items: &[MemoryItem], threshold: f32) -> Vec<Vec<&MemoryItem>> {
    let tokens: Vec<HashSet<String>> = items.iter().map(|item| token_set(&item.content)).collect();
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for (i, item_tokens) in tokens.iter().enumerate() {
        let home = clusters.iter().position(|cluster| {
            cluster
                .iter()
                .any(|&j| jaccard(item_tokens, &tokens[j]) >= threshold)
        });
        match home {
            Some(index) => clusters[index].push(i),
            None => clusters.push(vec![i]),
        }
    }

    clusters
        .into_iter()
        .filter(|cluster| cluster.len() > 1)
        .map(|cluster| cluster.into_iter().map(|i| &items[i]).collect())
        .collect()
}
