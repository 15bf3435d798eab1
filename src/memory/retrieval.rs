//! Similarity-ranked memory retrieval
//!
//! With an embedding service, memories are scored by cosine similarity of
//! their stored embedding against the query embedding; memories without an
//! embedding are skipped. Without one (or when embedding the query fails),
//! scoring falls back to Jaccard similarity over tokens.
//!
//! The base similarity is then adjusted:
//! `+ recency_boost * (1 - hours_since_access / 24)` (never negative, never
//! above `recency_boost`) and `+ importance * importance_boost`, capped at 1.0.

use crate::clock::Clock;
use crate::config::RetrievalConfig;
use crate::embeddings::{cosine_similarity, EmbeddingService};
use crate::memory::store::MemoryStore;
use crate::memory::text::{jaccard, token_set};
use crate::memory::SharedMemory;
use crate::types::{MemoryId, MemoryItem};
use serde::Serialize;
use std::sync::Arc;

/// Per-call overrides of the configured limits
#[derive(Debug, Clone, Copy, Default)]
pub struct RetrievalOptions {
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
}

impl RetrievalOptions {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k: Some(top_k),
            min_similarity: None,
        }
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = Some(min_similarity);
        self
    }
}

/// A memory with its adjusted similarity to the query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: MemoryItem,
    pub similarity: f32,
}

pub struct MemoryRetrieval {
    config: RetrievalConfig,
    embedder: Option<Arc<dyn EmbeddingService>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRetrieval {
    pub fn new(
        config: RetrievalConfig,
        embedder: Option<Arc<dyn EmbeddingService>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            embedder,
            clock,
        }
    }

    /// Rank memories against a query without touching access stats
    pub async fn retrieve(
        &self,
        memory: &SharedMemory,
        query: &str,
        options: RetrievalOptions,
    ) -> Vec<ScoredMemory> {
        let query_embedding = self.embed_query(query).await;
        let store = memory.read().await;
        self.rank(&store, query, query_embedding.as_deref(), options)
    }

    /// Rank memories and count an access on every returned item
    pub async fn retrieve_and_update(
        &self,
        memory: &SharedMemory,
        query: &str,
        options: RetrievalOptions,
    ) -> Vec<ScoredMemory> {
        let query_embedding = self.embed_query(query).await;
        let mut store = memory.write().await;
        let mut results = self.rank(&store, query, query_embedding.as_deref(), options);

        let ids: Vec<MemoryId> = results.iter().map(|scored| scored.memory.id).collect();
        store.record_access(&ids);
        for scored in &mut results {
            if let Some(item) = store.peek(&scored.memory.id) {
                scored.memory = item.clone();
            }
        }
        results
    }

    /// Score every memory in `store`
    ///
    /// `query_embedding` selects vector scoring; `None` selects lexical scoring.
    pub fn rank(
        &self,
        store: &MemoryStore,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: RetrievalOptions,
    ) -> Vec<ScoredMemory> {
        let top_k = options.top_k.unwrap_or(self.config.top_k);
        let min_similarity = options.min_similarity.unwrap_or(self.config.min_similarity);
        let now = self.clock.now();
        let query_tokens = token_set(query);

        let mut results: Vec<ScoredMemory> = store
            .get_all()
            .into_iter()
            .filter_map(|item| {
                let base = match query_embedding {
                    Some(query_embedding) => {
                        cosine_similarity(query_embedding, item.embedding.as_deref()?)
                    }
                    None => jaccard(&query_tokens, &token_set(&item.content)),
                };

                let hours = item.hours_since_access(now) as f32;
                let recency = (self.config.recency_boost * (1.0 - hours / 24.0))
                    .clamp(0.0, self.config.recency_boost);
                let similarity =
                    (base + recency + item.importance * self.config.importance_boost).min(1.0);

                (similarity >= min_similarity).then_some(ScoredMemory {
                    memory: item,
                    similarity,
                })
            })
            .collect();

        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        results.truncate(top_k);
        results
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!("Query embedding failed, using lexical similarity: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MemoryConfig;
    use crate::embeddings::MockEmbeddingService;
    use crate::error::RuntimeError;
    use crate::types::{MemoryType, NewMemory};
    use proptest::prelude::*;
    use tokio::sync::RwLock;

    fn shared(clock: &ManualClock) -> SharedMemory {
        Arc::new(RwLock::new(MemoryStore::new(
            "agent",
            MemoryConfig::default(),
            Arc::new(clock.clone()),
        )))
    }

    fn no_boost() -> RetrievalConfig {
        RetrievalConfig {
            top_k: 5,
            min_similarity: 0.0,
            recency_boost: 0.0,
            importance_boost: 0.0,
        }
    }

    #[tokio::test]
    async fn test_lexical_ranking() {
        let clock = ManualClock::starting_now();
        let memory = shared(&clock);
        {
            let mut store = memory.write().await;
            store.add(NewMemory::new(MemoryType::Semantic, "rust async runtime", 0.5));
            store.add(NewMemory::new(MemoryType::Semantic, "rust borrow checker", 0.5));
            store.add(NewMemory::new(MemoryType::Semantic, "banana bread", 0.5));
        }

        let retrieval = MemoryRetrieval::new(
            RetrievalConfig {
                min_similarity: 0.01,
                ..no_boost()
            },
            None,
            Arc::new(clock.clone()),
        );
        let results = retrieval
            .retrieve(&memory, "rust async", RetrievalOptions::default())
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.content, "rust async runtime");
        assert!((results[0].similarity - 2.0 / 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_boosts_and_cap() {
        let clock = ManualClock::starting_now();
        let memory = shared(&clock);
        memory
            .write()
            .await
            .add(NewMemory::new(MemoryType::Semantic, "rust", 1.0));

        let retrieval = MemoryRetrieval::new(
            RetrievalConfig::default(),
            None,
            Arc::new(clock.clone()),
        );
        let fresh = retrieval
            .retrieve(&memory, "rust", RetrievalOptions::default())
            .await;
        assert_eq!(fresh[0].similarity, 1.0);

        // a day idle removes the recency boost entirely
        clock.advance(chrono::Duration::hours(48));
        let results = retrieval
            .retrieve(&memory, "python", RetrievalOptions::default())
            .await;
        assert_eq!(results.len(), 1);
        assert!((results[0].similarity - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_retrieve_and_update_bumps_access() {
        let clock = ManualClock::starting_now();
        let memory = shared(&clock);
        let item = memory
            .write()
            .await
            .add(NewMemory::new(MemoryType::Episodic, "tokio select", 0.5));

        let retrieval = MemoryRetrieval::new(no_boost(), None, Arc::new(clock.clone()));
        retrieval
            .retrieve(&memory, "tokio", RetrievalOptions::default())
            .await;
        assert_eq!(memory.read().await.peek(&item.id).unwrap().access_count, 0);

        let results = retrieval
            .retrieve_and_update(&memory, "tokio", RetrievalOptions::default())
            .await;
        assert_eq!(results[0].memory.access_count, 1);
        assert_eq!(memory.read().await.peek(&item.id).unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_vector_mode_skips_unembedded() {
        let clock = ManualClock::starting_now();
        let memory = shared(&clock);
        {
            let mut store = memory.write().await;
            store.add(NewMemory::new(MemoryType::Semantic, "with", 0.5).with_embedding(vec![1.0, 0.0]));
            store.add(NewMemory::new(MemoryType::Semantic, "without", 0.5));
        }

        let mut embedder = MockEmbeddingService::new();
        embedder
            .expect_embed()
            .returning(|_| Ok(vec![1.0, 0.0]));
        let retrieval = MemoryRetrieval::new(no_boost(), Some(Arc::new(embedder)), Arc::new(clock.clone()));

        let results = retrieval
            .retrieve(&memory, "anything", RetrievalOptions::default())
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, "with");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let clock = ManualClock::starting_now();
        let memory = shared(&clock);
        memory
            .write()
            .await
            .add(NewMemory::new(MemoryType::Semantic, "lexical match", 0.5));

        let mut embedder = MockEmbeddingService::new();
        embedder
            .expect_embed()
            .returning(|_| Err(RuntimeError::Embedding("offline".to_string())));
        let retrieval = MemoryRetrieval::new(no_boost(), Some(Arc::new(embedder)), Arc::new(clock.clone()));

        let results = retrieval
            .retrieve(&memory, "lexical match", RetrievalOptions::default())
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].similarity, 1.0);
    }

    proptest! {
        #[test]
        fn prop_ranked_filtered_truncated(
            contents in prop::collection::vec("[a-d ]{1,12}", 0..25),
            importances in prop::collection::vec(0.0f32..=1.0, 25),
            query in "[a-d ]{1,8}",
            top_k in 1usize..6,
            min_similarity in 0.0f32..0.6,
        ) {
            let clock = ManualClock::starting_now();
            let mut store = MemoryStore::new("agent", MemoryConfig::default(), Arc::new(clock.clone()));
            for (content, importance) in contents.iter().zip(importances) {
                store.add(NewMemory::new(MemoryType::Semantic, content.clone(), importance));
            }
            let retrieval = MemoryRetrieval::new(RetrievalConfig::default(), None, Arc::new(clock));

            let results = retrieval.rank(
                &store,
                &query,
                None,
                RetrievalOptions::top_k(top_k).with_min_similarity(min_similarity),
            );

            prop_assert!(results.len() <= top_k);
            for scored in &results {
                prop_assert!(scored.similarity >= min_similarity);
                prop_assert!(scored.similarity <= 1.0);
            }
            for pair in results.windows(2) {
                prop_assert!(pair[0].similarity >= pair[1].similarity);
            }
        }
    }
}
