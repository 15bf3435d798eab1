//! Embedding generation for vector similarity retrieval
//!
//! The embedding capability is optional. When an agent has none, retrieval
//! falls back to lexical similarity.

use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Embedding dimension of the built-in hashing embedder
pub const HASHING_EMBEDDING_DIM: usize = 384;

/// Embedding service trait defining required operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get embedding dimensionality
    fn dimensions(&self) -> usize;
}

/// Hash of the given parts that does not change between builds or platforms
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

/// Deterministic local embedder based on hashed character n-grams and words
///
/// No model, no network. Good enough to rank near-duplicates and for tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        (stable_hash(&[token]) % self.dimensions as u64) as usize
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0; self.dimensions];

        // Character n-grams hashing
        let text_lower = text.to_lowercase();
        let chars: Vec<char> = text_lower.chars().collect();
        for window_size in 2..=4 {
            for window in chars.windows(window_size) {
                let gram: String = window.iter().collect();
                embedding[self.bucket(&gram)] += 1.0;
            }
        }

        // Words weighted more than character n-grams
        for word in text_lower.split_whitespace() {
            embedding[self.bucket(word)] += 2.0;
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut embedding {
                *val /= magnitude;
            }
        }

        embedding
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingService for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let vec1 = vec![1.0, 0.0, 0.0];
        let vec2 = vec![1.0, 0.0, 0.0];
        let vec3 = vec![0.0, 1.0, 0.0];

        // Same vectors
        assert!((cosine_similarity(&vec1, &vec2) - 1.0).abs() < 0.01);

        // Orthogonal vectors
        assert!((cosine_similarity(&vec1, &vec3) - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_cosine_similarity_different_lengths() {
        let vec1 = vec![1.0, 2.0, 3.0];
        let vec2 = vec![1.0, 2.0];

        assert_eq!(cosine_similarity(&vec1, &vec2), 0.0);
    }

    #[test]
    fn test_cosine_similarity_zero_vectors() {
        let vec1 = vec![0.0, 0.0, 0.0];
        let vec2 = vec![1.0, 2.0, 3.0];

        assert_eq!(cosine_similarity(&vec1, &vec2), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("tokio runtime internals").await.unwrap();
        let b = embedder.embed("tokio runtime internals").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), embedder.dimensions());

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_hashing_embedder_ranks_similar_text_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_sync("rust async runtime");
        let close = embedder.embed_sync("the rust async runtime tokio");
        let far = embedder.embed_sync("banana bread recipe");

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_stable_hash_is_pinned() {
        // fixed across toolchains; embeddings handed to a sink depend on it
        assert_eq!(stable_hash(&["tokio"]), 14560586093759772365);
        assert_ne!(stable_hash(&["ab", "c"]), stable_hash(&["a", "bc"]));
    }
}
