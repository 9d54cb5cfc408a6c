//! In-memory vector cache backing brute-force cosine search.
//!
//! The cache mirrors the persisted `vectors` table: every entry holds the
//! original embedding (handed to the clustering passes), a pre-normalized
//! copy (used for dot-product cosine scoring), and the denormalized context
//! needed to return a search hit without touching the store.
//!
//! Search is deliberately O(n·d): for a single-workspace corpus the whole
//! cache fits in RAM (~3 KiB per 768-dim vector) and a flat scan with a
//! partial sort beats maintaining an ANN structure.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::VectorRecord;

/// One cached embedding with its denormalized search context.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub normalized: Vec<f32>,
    pub text: String,
    pub asset_id: String,
    pub asset_path: String,
    pub anchor_json: String,
    pub pipeline_version: String,
}

/// A single search result. `score` is the cosine distance (1 − similarity);
/// lower is closer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub asset_id: String,
    pub asset_path: String,
    pub anchor_json: String,
}

#[derive(Debug, Default)]
pub struct VectorCache {
    entries: Vec<CacheEntry>,
    dimension: Option<usize>,
}

impl VectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Fix the expected dimension before the first insert (the embedder
    /// calls this after probing the model). A dimension learned from data
    /// is never overwritten.
    pub fn set_dimension(&mut self, dim: usize) {
        if self.dimension.is_none() && dim > 0 {
            self.dimension = Some(dim);
        }
    }

    /// Append one record. The first vector fixes the dimension; later
    /// vectors of a different dimension are rejected.
    pub fn push(&mut self, record: &VectorRecord) -> Result<(), String> {
        let dim = record.vector.len();
        match self.dimension {
            None => self.dimension = Some(dim),
            Some(expected) if expected != dim => {
                return Err(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    expected, dim
                ));
            }
            Some(_) => {}
        }
        self.entries.push(CacheEntry {
            chunk_id: record.chunk_id.clone(),
            normalized: normalize(&record.vector),
            vector: record.vector.clone(),
            text: record.text.clone(),
            asset_id: record.asset_id.clone(),
            asset_path: record.asset_path.clone(),
            anchor_json: record.anchor_json.clone(),
            pipeline_version: record.pipeline_version.clone(),
        });
        Ok(())
    }

    pub fn remove_by_asset(&mut self, asset_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.asset_id != asset_id);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dimension = None;
    }

    /// Brute-force cosine search: normalize the query, score every cached
    /// vector by dot product, convert similarity to distance (1 − s), and
    /// return the k closest. Ordering among equal distances is unspecified.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if self.entries.is_empty() || k == 0 {
            return Vec::new();
        }
        let q = normalize(query);
        if q.iter().all(|&x| x == 0.0) {
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = self
            .entries
            .par_iter()
            .enumerate()
            .map(|(i, entry)| {
                let sim = dot(&q, &entry.normalized);
                (1.0 - sim, i)
            })
            .collect();

        let k = k.min(scored.len());
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
            scored.truncate(k);
        }
        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

        scored
            .into_iter()
            .map(|(distance, i)| {
                let entry = &self.entries[i];
                SearchHit {
                    chunk_id: entry.chunk_id.clone(),
                    score: distance,
                    text: entry.text.clone(),
                    asset_id: entry.asset_id.clone(),
                    asset_path: entry.asset_path.clone(),
                    anchor_json: entry.anchor_json.clone(),
                }
            })
            .collect()
    }

    /// Slices for the clustering passes: (chunk ids, original vectors, texts).
    pub fn get_all(&self) -> (Vec<String>, Vec<Vec<f32>>, Vec<String>) {
        let ids = self.entries.iter().map(|e| e.chunk_id.clone()).collect();
        let vectors = self.entries.iter().map(|e| e.vector.clone()).collect();
        let texts = self.entries.iter().map(|e| e.text.clone()).collect();
        (ids, vectors, texts)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.entries.iter().any(|e| e.chunk_id == chunk_id)
    }
}

/// L2-normalize a vector. The zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity over raw (not pre-normalized) vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

// ---------------------------------------------------------------------------
// Blob codec: little-endian IEEE-754 f32, bit-exact round trip
// ---------------------------------------------------------------------------

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(v.len() * 4);
    for x in v {
        blob.extend_from_slice(&x.to_le_bytes());
    }
    blob
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: id.to_string(),
            vector,
            text: format!("text-{}", id),
            asset_id: "asset".to_string(),
            asset_path: "/tmp/a.txt".to_string(),
            anchor_json: r#"{"asset_id":"asset"}"#.to_string(),
            pipeline_version: "v1".to_string(),
        }
    }

    #[test]
    fn blob_round_trip_is_bit_exact() {
        let v = vec![0.1f32, -2.5, f32::MIN_POSITIVE, 1e30, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn normalized_vectors_are_unit_length() {
        let n = normalize(&[3.0, 4.0]);
        let len: f32 = n.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((len - 1.0).abs() < 1e-5);
        // Re-normalizing a unit vector is a no-op to within tolerance.
        let again = normalize(&n);
        for (a, b) in n.iter().zip(again.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn zero_vector_normalizes_to_itself() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn dimension_is_fixed_by_first_insert() {
        let mut cache = VectorCache::new();
        cache.push(&record("a", vec![1.0, 0.0])).unwrap();
        assert_eq!(cache.dimension(), Some(2));
        assert!(cache.push(&record("b", vec![1.0, 0.0, 0.0])).is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn search_orders_by_ascending_distance() {
        let mut cache = VectorCache::new();
        cache.push(&record("x", vec![1.0, 0.0])).unwrap();
        cache.push(&record("y", vec![0.0, 1.0])).unwrap();
        cache.push(&record("z", vec![0.7, 0.7])).unwrap();

        let hits = cache.search(&[1.0, 0.0], 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk_id, "x");
        assert!(hits[0].score <= hits[1].score && hits[1].score <= hits[2].score);
        assert!(hits[0].score.abs() < 1e-5);
    }

    #[test]
    fn search_on_empty_cache_returns_empty() {
        let cache = VectorCache::new();
        assert!(cache.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn remove_by_asset_drops_entries() {
        let mut cache = VectorCache::new();
        cache.push(&record("a", vec![1.0, 0.0])).unwrap();
        let mut other = record("b", vec![0.0, 1.0]);
        other.asset_id = "other".to_string();
        cache.push(&other).unwrap();

        assert_eq!(cache.remove_by_asset("asset"), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("b"));
    }
}
