//! Embedding capability for semantic relevance scoring.
//!
//! The selector scores each candidate file by cosine similarity between an
//! embedding of the phase's task description and a precomputed embedding of
//! the file's content. Which model produces those vectors is a deployment
//! decision behind `EmbeddingBackend`; when none is configured the selector
//! fails closed instead of falling back to a non-semantic ranking.

use crate::errors::ContextError;

/// Produces embedding vectors for arbitrary text. Implementations must be
/// deterministic for identical input within one process, or context
/// selection loses its reproducibility guarantee.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ContextError>;
}

/// Cosine similarity of two vectors. Zero for mismatched or degenerate
/// inputs rather than NaN, so scores always sort.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministic hashed bag-of-words embedding. A real deployment plugs in
/// a model-backed implementation; this one exists so tests and offline use
/// have a concrete, reproducible backend with genuine term-overlap
/// semantics.
#[derive(Debug, Clone)]
pub struct HashedBagOfWords {
    dims: usize,
}

impl Default for HashedBagOfWords {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

impl HashedBagOfWords {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn bucket(&self, term: &str) -> usize {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(term.as_bytes());
        let n = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        (n % self.dims as u64) as usize
    }
}

impl EmbeddingBackend for HashedBagOfWords {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ContextError> {
        let mut vec = vec![0.0f32; self.dims];
        for term in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 1)
        {
            vec[self.bucket(&term.to_lowercase())] += 1.0;
        }
        Ok(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        // Degenerate inputs score zero, never NaN
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0], &[0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_hashed_bag_of_words_is_deterministic() {
        let backend = HashedBagOfWords::default();
        let a = backend.embed("parse the unified diff header").unwrap();
        let b = backend.embed("parse the unified diff header").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let backend = HashedBagOfWords::default();
        let query = backend.embed("database schema migration table").unwrap();
        let related = backend.embed("create table users; alter table schema migration").unwrap();
        let unrelated = backend.embed("websocket ping pong heartbeat frame").unwrap();
        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated),
            "related file should outrank unrelated file"
        );
    }
}
