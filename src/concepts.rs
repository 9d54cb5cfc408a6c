//! Concept building: k-means clustering over the vector cache, LLM labels
//! for each cluster, a k-NN cosine similarity graph, and sub-cluster
//! refinement.
//!
//! The k-means RNG is seeded from (pipeline version, model, n), so concept
//! rows are reproducible across runs of an unchanged corpus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::ids;
use crate::llm::LlmClient;
use crate::model::{ConceptNode, EdgeType, GraphEdge, PIPELINE_VERSION};
use crate::store::Store;
use crate::vectors::normalize;

const MAX_KMEANS_ITERS: usize = 50;
const MAX_EXEMPLARS: usize = 3;
const EXEMPLAR_TRUNCATE_CHARS: usize = 500;
const LABEL_ATTEMPTS: u32 = 3;
const LABEL_BACKOFF_BASE_SECS: u64 = 5;

const LABEL_PROMPT: &str = "\
You name clusters of related text passages. Given the exemplar passages, \
respond with a single JSON object, no prose: \
{\"label\": \"2-5 word name\", \"description\": \"one sentence\", \
\"keywords\": [\"...\"]}";

#[derive(Debug, Deserialize)]
struct LabelReply {
    #[serde(default)]
    label: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    #[allow(dead_code)]
    keywords: Vec<String>,
}

pub struct ConceptBuilder {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    fast_mode: bool,
}

impl ConceptBuilder {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>) -> Self {
        Self {
            store,
            llm,
            fast_mode: false,
        }
    }

    pub fn with_fast_mode(mut self) -> Self {
        self.fast_mode = true;
        self
    }

    /// Cluster every cached vector at the given level and persist one labeled
    /// concept node per non-empty cluster, with concept_member edges to the
    /// member chunks. Returns the persisted concepts.
    pub async fn build_concepts(
        &self,
        level: i64,
        k_override: Option<usize>,
    ) -> AppResult<Vec<ConceptNode>> {
        let (chunk_ids, vectors, texts) = self.store.vectors_get_all();
        let n = vectors.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let model = match self.llm.chat_model().await {
            Ok(model) => model,
            Err(e) => {
                warn!(error = %e, "no chat model available; skipping concept build");
                return Ok(Vec::new());
            }
        };

        let k = k_override.unwrap_or_else(|| (n / 3).clamp(2, 20)).min(n).max(1);
        let mut rng = seeded_rng(&model, n);
        let (labels, centroids) = kmeans(&vectors, k, MAX_KMEANS_ITERS, &mut rng);

        let mut concepts = Vec::new();
        for cluster_idx in 0..k {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == cluster_idx).collect();
            if members.is_empty() {
                continue;
            }

            let exemplars = closest_to_centroid(&members, &vectors, &centroids[cluster_idx]);
            let exemplar_texts: Vec<&str> = exemplars
                .iter()
                .map(|&i| truncate_chars(&texts[i], EXEMPLAR_TRUNCATE_CHARS))
                .collect();
            let (label, description) = self.label_cluster(&model, &exemplar_texts).await;

            let concept = ConceptNode {
                id: ids::concept_id(level, cluster_idx, PIPELINE_VERSION),
                level,
                label,
                description,
                parent_id: None,
                exemplar_chunk_ids: exemplars.iter().map(|&i| chunk_ids[i].clone()).collect(),
                pipeline_version: PIPELINE_VERSION.to_string(),
                model_id: model.clone(),
                created_at: Utc::now(),
            };
            self.store.upsert_concept(&concept)?;
            self.persist_member_edges(&concept.id, &members, &chunk_ids)?;
            concepts.push(concept);
        }

        info!(n, k, concepts = concepts.len(), level, "concept build complete");
        Ok(concepts)
    }

    /// Brute-force k-NN similarity graph over the normalized cache. Keeps
    /// the top `k_nn` strictly positive cosine neighbors per vector.
    /// Returns the number of edges written.
    pub fn build_similarity_graph(&self, k_nn: usize) -> AppResult<usize> {
        let (chunk_ids, vectors, _) = self.store.vectors_get_all();
        let n = vectors.len();
        if n < 2 || k_nn == 0 {
            return Ok(0);
        }

        let normalized: Vec<Vec<f32>> = vectors.iter().map(|v| normalize(v)).collect();
        let evidence = json!({"method": "cosine_knn", "k": k_nn});

        let edges: Vec<GraphEdge> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let mut sims: Vec<(f32, usize)> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| {
                        let sim: f32 = normalized[i]
                            .iter()
                            .zip(normalized[j].iter())
                            .map(|(a, b)| a * b)
                            .sum();
                        (sim, j)
                    })
                    .filter(|(sim, _)| *sim > 0.0)
                    .collect();
                sims.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
                sims.truncate(k_nn);

                let chunk_ids = &chunk_ids;
                let evidence = evidence.clone();
                sims.into_iter()
                    .map(move |(sim, j)| GraphEdge {
                        id: ids::edge_id("similarity", &chunk_ids[i], &chunk_ids[j]),
                        edge_type: EdgeType::Similarity,
                        source_id: chunk_ids[i].clone(),
                        target_id: chunk_ids[j].clone(),
                        weight: f64::from(sim).clamp(0.0, 1.0),
                        evidence: Some(evidence.clone()),
                        pipeline_version: PIPELINE_VERSION.to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        self.store.insert_edges(&edges)?;
        debug!(edges = edges.len(), k_nn, "similarity graph written");
        Ok(edges.len())
    }

    /// Split one concept's members into `n_sub` sub-clusters at level + 1.
    /// Fewer members than `n_sub` yields an empty result.
    pub async fn refine_concept(
        &self,
        concept_id: &str,
        n_sub: usize,
    ) -> AppResult<Vec<ConceptNode>> {
        let parent = self
            .store
            .get_concept(concept_id)?
            .ok_or_else(|| AppError::NotFound(format!("concept {}", concept_id)))?;
        let member_ids = self.store.concept_member_chunk_ids(concept_id)?;
        if member_ids.len() < n_sub || n_sub == 0 {
            return Ok(Vec::new());
        }

        let (all_ids, all_vectors, all_texts) = self.store.vectors_get_all();
        let mut member_indices = Vec::new();
        for member in &member_ids {
            if let Some(pos) = all_ids.iter().position(|id| id == member) {
                member_indices.push(pos);
            }
        }
        if member_indices.len() < n_sub {
            return Ok(Vec::new());
        }

        let model = match self.llm.chat_model().await {
            Ok(model) => model,
            Err(e) => {
                warn!(error = %e, "no chat model available; skipping refinement");
                return Ok(Vec::new());
            }
        };

        let vectors: Vec<Vec<f32>> = member_indices
            .iter()
            .map(|&i| all_vectors[i].clone())
            .collect();
        let mut rng = seeded_rng(&model, vectors.len());
        let (labels, centroids) = kmeans(&vectors, n_sub, MAX_KMEANS_ITERS, &mut rng);

        let child_level = parent.level + 1;
        let mut children = Vec::new();
        for cluster_idx in 0..n_sub {
            let members: Vec<usize> = (0..vectors.len())
                .filter(|&i| labels[i] == cluster_idx)
                .collect();
            if members.is_empty() {
                continue;
            }

            let exemplars = closest_to_centroid(&members, &vectors, &centroids[cluster_idx]);
            let exemplar_texts: Vec<&str> = exemplars
                .iter()
                .map(|&i| {
                    truncate_chars(&all_texts[member_indices[i]], EXEMPLAR_TRUNCATE_CHARS)
                })
                .collect();
            let (label, description) = self.label_cluster(&model, &exemplar_texts).await;

            let child = ConceptNode {
                id: ids::sub_concept_id(child_level, concept_id, cluster_idx, PIPELINE_VERSION),
                level: child_level,
                label,
                description,
                parent_id: Some(concept_id.to_string()),
                exemplar_chunk_ids: exemplars
                    .iter()
                    .map(|&i| all_ids[member_indices[i]].clone())
                    .collect(),
                pipeline_version: PIPELINE_VERSION.to_string(),
                model_id: model.clone(),
                created_at: Utc::now(),
            };
            self.store.upsert_concept(&child)?;

            let member_chunk_ids: Vec<String> = members
                .iter()
                .map(|&i| all_ids[member_indices[i]].clone())
                .collect();
            let member_refs: Vec<usize> = (0..member_chunk_ids.len()).collect();
            self.persist_member_edges(&child.id, &member_refs, &member_chunk_ids)?;
            self.store.insert_edges(&[GraphEdge {
                id: ids::edge_id("parent_child", concept_id, &child.id),
                edge_type: EdgeType::ParentChild,
                source_id: concept_id.to_string(),
                target_id: child.id.clone(),
                weight: 1.0,
                evidence: None,
                pipeline_version: PIPELINE_VERSION.to_string(),
            }])?;
            children.push(child);
        }

        info!(parent = %concept_id, children = children.len(), "refinement complete");
        Ok(children)
    }

    fn persist_member_edges(
        &self,
        concept_id: &str,
        members: &[usize],
        chunk_ids: &[String],
    ) -> AppResult<()> {
        let edges: Vec<GraphEdge> = members
            .iter()
            .map(|&i| GraphEdge {
                id: ids::edge_id("concept_member", concept_id, &chunk_ids[i]),
                edge_type: EdgeType::ConceptMember,
                source_id: concept_id.to_string(),
                target_id: chunk_ids[i].clone(),
                weight: 1.0,
                evidence: None,
                pipeline_version: PIPELINE_VERSION.to_string(),
            })
            .collect();
        self.store.insert_edges(&edges)
    }

    /// Ask the chat model to label a cluster; three attempts with linear
    /// backoff, then a deterministic fallback from the first exemplar.
    async fn label_cluster(&self, model: &str, exemplars: &[&str]) -> (String, String) {
        let user = exemplars
            .iter()
            .enumerate()
            .map(|(i, text)| format!("Passage {}:\n{}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n");

        for attempt in 1..=LABEL_ATTEMPTS {
            let messages = [
                crate::llm::ChatMessage::system(LABEL_PROMPT),
                crate::llm::ChatMessage::user(user.clone()),
            ];
            match self.llm.chat(&messages, model, 0.3, 256).await {
                Ok(reply) => {
                    let cleaned = crate::llm::strip_code_fences(&reply);
                    if let Ok(parsed) = serde_json::from_str::<LabelReply>(&cleaned) {
                        if !parsed.label.is_empty() {
                            return (parsed.label, parsed.description);
                        }
                    }
                    warn!(attempt, "cluster label reply was not usable JSON");
                }
                Err(e) => warn!(attempt, error = %e, "cluster label request failed"),
            }
            if !self.fast_mode {
                tokio::time::sleep(Duration::from_secs(LABEL_BACKOFF_BASE_SECS * attempt as u64))
                    .await;
            }
        }

        let prefix: String = exemplars
            .first()
            .map(|t| t.chars().take(50).collect())
            .unwrap_or_default();
        (format!("Cluster: {}...", prefix), String::new())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// RNG seeded from (pipeline version, model, n): clustering is reproducible
/// for an unchanged corpus and configuration.
fn seeded_rng(model: &str, n: usize) -> StdRng {
    let digest = crate::ids::sha256_hex(format!("{}:{}:{}", PIPELINE_VERSION, model, n).as_bytes());
    let seed = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    StdRng::seed_from_u64(seed)
}

/// Exemplar selection: up to three members closest to the centroid.
fn closest_to_centroid(members: &[usize], vectors: &[Vec<f32>], centroid: &[f32]) -> Vec<usize> {
    let mut scored: Vec<(f32, usize)> = members
        .iter()
        .map(|&i| (squared_distance(&vectors[i], centroid), i))
        .collect();
    scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    scored
        .into_iter()
        .take(MAX_EXEMPLARS)
        .map(|(_, i)| i)
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// k-means++ initialization followed by Lloyd iteration. With n ≤ k every
/// vector becomes its own cluster. Returns (labels, centroids).
pub fn kmeans(
    vectors: &[Vec<f32>],
    k: usize,
    max_iters: usize,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<Vec<f32>>) {
    let n = vectors.len();
    if n == 0 || k == 0 {
        return (Vec::new(), Vec::new());
    }
    if n <= k {
        let labels = (0..n).collect();
        let centroids = vectors.to_vec();
        return (labels, centroids);
    }

    // k-means++: first centroid uniform, the rest weighted by squared
    // distance to the nearest already-chosen centroid.
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..n)].clone());
    while centroids.len() < k {
        let distances: Vec<f32> = vectors
            .iter()
            .map(|v| {
                centroids
                    .iter()
                    .map(|c| squared_distance(v, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = distances.iter().sum();
        if total <= f32::EPSILON {
            // All points coincide with chosen centroids; fill uniformly.
            centroids.push(vectors[rng.gen_range(0..n)].clone());
            continue;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut chosen = n - 1;
        for (i, d) in distances.iter().enumerate() {
            target -= d;
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(vectors[chosen].clone());
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iters {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(c, centroid)| (squared_distance(v, centroid), c))
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, c)| c)
                .unwrap_or(0);
            if labels[i] != nearest {
                labels[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let dim = vectors[0].len();
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, v) in vectors.iter().enumerate() {
            counts[labels[i]] += 1;
            for (d, x) in v.iter().enumerate() {
                sums[labels[i]][d] += x;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for d in 0..dim {
                    sums[c][d] /= counts[c] as f32;
                }
                centroids[c] = sums[c].clone();
            }
        }
    }

    (labels, centroids)
}
