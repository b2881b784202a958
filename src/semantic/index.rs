//! In-memory embedding table with cosine similarity ranking.
//!
//! Holds one embedding per photo and ranks them against a query embedding.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::library::PhotoId;

/// In-memory embedding table for semantic search.
///
/// Stores embeddings keyed by photo identifier, supporting:
/// - Insert/remove while a scan reconciles the library
/// - Top-K cosine similarity ranking
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    /// Photo ID -> embedding
    entries: HashMap<PhotoId, Vec<f32>>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// One ranked photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub identifier: PhotoId,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

impl EmbeddingTable {
    /// Create a new empty table with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create a table with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// Zero vectors are accepted; they simply score 0 against everything.
    pub fn insert(&mut self, id: PhotoId, embedding: Vec<f32>) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        self.entries.insert(id, embedding);
        Ok(())
    }

    pub fn remove(&mut self, id: &PhotoId) -> Option<Vec<f32>> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &PhotoId) -> Option<&[f32]> {
        self.entries.get(id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: &PhotoId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &PhotoId> + '_ {
        self.entries.keys()
    }

    /// Rank every photo against `query` and keep the best `k`.
    ///
    /// Results are sorted by score (highest first); equal scores are ordered
    /// by identifier so the output is fully deterministic.
    pub fn rank(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = l2_norm(query);

        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|(id, embedding)| SearchHit {
                identifier: id.clone(),
                score: similarity_with_norm(query, query_norm, embedding),
            })
            .collect();

        // partial selection first, so only the kept prefix gets fully sorted
        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, compare_hits);
            hits.truncate(k);
        }
        hits.sort_unstable_by(compare_hits);

        Ok(hits)
    }
}

/// Descending score, then ascending identifier.
fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.identifier.cmp(&b.identifier))
}

/// Cosine similarity of two vectors of equal length.
///
/// Accumulates in f64. A zero-norm side yields 0.0 rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    similarity_with_norm(a, l2_norm(a), b)
}

fn similarity_with_norm(query: &[f32], query_norm: f64, target: &[f32]) -> f32 {
    let target_norm = l2_norm(target);
    if query_norm == 0.0 || target_norm == 0.0 {
        return 0.0;
    }

    let dot_product: f64 = query
        .iter()
        .zip(target.iter())
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum();
    let score = (dot_product / (query_norm * target_norm)) as f32;

    // adding 0.0 turns -0.0 into 0.0 so both tie under total_cmp
    if score.is_finite() {
        score + 0.0
    } else {
        0.0
    }
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f64 {
    v.iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt()
}

/// Errors that can occur during table operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> PhotoId {
        PhotoId::file(name)
    }

    #[test]
    fn test_new_table() {
        let table = EmbeddingTable::new(512);
        assert_eq!(table.dimensions(), 512);
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = EmbeddingTable::new(3);
        let embedding = vec![1.0, 0.0, 0.0];

        table.insert(id("a"), embedding.clone()).unwrap();

        assert_eq!(table.len(), 1);
        assert!(table.contains(&id("a")));
        assert_eq!(table.get(&id("a")), Some(embedding.as_slice()));
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut table = EmbeddingTable::new(3);
        let result = table.insert(id("a"), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_remove() {
        let mut table = EmbeddingTable::new(3);
        table.insert(id("a"), vec![1.0, 0.0, 0.0]).unwrap();

        assert!(table.remove(&id("a")).is_some());
        assert!(!table.contains(&id("a")));
        assert!(table.remove(&id("a")).is_none());
    }

    #[test]
    fn test_rank_orders_and_breaks_ties_by_identifier() {
        let mut table = EmbeddingTable::new(2);
        // inserted out of order on purpose
        table.insert(id("C"), vec![1.0, 0.0]).unwrap();
        table.insert(id("B"), vec![0.0, 1.0]).unwrap();
        table.insert(id("A"), vec![1.0, 0.0]).unwrap();

        let hits = table.rank(&[1.0, 0.0], 10).unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.identifier.key()).collect();
        assert_eq!(ids, vec!["A", "C", "B"]);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 1.0);
        assert_eq!(hits[2].score, 0.0);
    }

    #[test]
    fn test_rank_is_deterministic() {
        let mut table = EmbeddingTable::new(3);
        for i in 0..200 {
            let x = (i % 7) as f32;
            table.insert(id(&format!("p{i:03}")), vec![1.0, x, 0.5]).unwrap();
        }

        let query = [0.3, 1.0, -0.2];
        let first = table.rank(&query, 25).unwrap();
        let second = table.rank(&query, 25).unwrap();
        assert_eq!(first, second);

        // a fresh table with the same content ranks identically
        let copy = table.clone();
        assert_eq!(copy.rank(&query, 25).unwrap(), first);
    }

    #[test]
    fn test_rank_truncation() {
        let mut table = EmbeddingTable::new(2);
        for i in 0..10 {
            table.insert(id(&format!("p{i}")), vec![1.0, i as f32 * 0.1]).unwrap();
        }

        let hits = table.rank(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].identifier, id("p0"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        // fewer entries than k: everything, still sorted
        let all = table.rank(&[1.0, 0.0], 50).unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(table.rank(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_prefix_matches_full_sort() {
        let mut table = EmbeddingTable::new(2);
        for i in 0..100 {
            let angle = (i as f32) * 0.37;
            table.insert(id(&format!("p{i}")), vec![angle.cos(), angle.sin()]).unwrap();
        }

        let query = [0.6, 0.8];
        let full = table.rank(&query, 100).unwrap();
        let top = table.rank(&query, 7).unwrap();
        assert_eq!(top.as_slice(), &full[..7]);
    }

    #[test]
    fn test_zero_vectors_score_zero() {
        let mut table = EmbeddingTable::new(3);
        table.insert(id("zero"), vec![0.0, 0.0, 0.0]).unwrap();
        table.insert(id("one"), vec![1.0, 0.0, 0.0]).unwrap();

        let hits = table.rank(&[1.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(hits[1].identifier, id("zero"));
        assert_eq!(hits[1].score, 0.0);

        // zero query: every score is 0, ordered by identifier
        let hits = table.rank(&[0.0, 0.0, 0.0], 10).unwrap();
        assert!(hits.iter().all(|h| h.score == 0.0 && !h.score.is_nan()));
        assert_eq!(hits[0].identifier, id("one"));
    }

    #[test]
    fn test_negative_zero_ties_with_zero() {
        let mut table = EmbeddingTable::new(2);
        // dot product underflows to -0.0 in f32
        table.insert(id("a.jpg"), vec![-1e-40, 1e10]).unwrap();
        table.insert(id("b.jpg"), vec![0.0, 1.0]).unwrap();

        let hits = table.rank(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.identifier.key()).collect();
        assert_eq!(ids, vec!["a.jpg", "b.jpg"]);
        assert!(hits.iter().all(|h| h.score.to_bits() == 0.0f32.to_bits()));
    }

    #[test]
    fn test_rank_query_dimension_mismatch() {
        let table = EmbeddingTable::new(3);
        let result = table.rank(&[1.0, 0.0], 5);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]), -1.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[1.0, 0.0]) - 0.70710677).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_long_vectors() {
        let a: Vec<f32> = (0..512).map(|i| ((i * 31 % 97) as f32 - 48.0) / 48.0).collect();
        let score = cosine_similarity(&a, &a);
        assert!((score - 1.0).abs() < 1e-6);
    }
}
