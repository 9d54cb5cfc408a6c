//! Vector search endpoints. Results come straight from the denormalized
//! cache and are enriched with the current annotation when one exists.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::MAX_SEARCH_QUERY_LENGTH;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::vectors::SearchHit;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

/// Over-fetch factor when a type filter will discard hits post-search.
const FILTER_OVERFETCH: usize = 4;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filter_asset_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuickSearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> AppResult<Json<Vec<Value>>> {
    run_search(&state, &req.query, req.limit, req.filter_asset_type.as_deref()).await
}

pub async fn quick_search(
    State(state): State<AppState>,
    Query(query): Query<QuickSearchQuery>,
) -> AppResult<Json<Vec<Value>>> {
    run_search(&state, &query.q, query.limit, None).await
}

async fn run_search(
    state: &AppState,
    query: &str,
    limit: Option<usize>,
    filter_asset_type: Option<&str>,
) -> AppResult<Json<Vec<Value>>> {
    if query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "query too long ({} chars, max {})",
            query.len(),
            MAX_SEARCH_QUERY_LENGTH
        )));
    }
    let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    // An empty cache means an empty result, never an error; the query is
    // not even embedded.
    if state.store.vector_count() == 0 {
        return Ok(Json(Vec::new()));
    }

    let model = state.llm.embedding_model().await?;
    let query_vec: Vec<f32> = state
        .llm
        .embed_single(query, &model)
        .await?
        .into_iter()
        .map(|x| x as f32)
        .collect();

    let fetch = match filter_asset_type {
        Some(_) => limit * FILTER_OVERFETCH,
        None => limit,
    };
    let mut hits = state.store.search_vectors(&query_vec, fetch);
    if let Some(filter) = filter_asset_type {
        let filter = filter.to_lowercase();
        hits.retain(|hit| asset_type_matches(&hit.asset_path, &filter));
        hits.truncate(limit);
    }

    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        results.push(render_hit(state, hit)?);
    }
    Ok(Json(results))
}

fn asset_type_matches(asset_path: &str, filter: &str) -> bool {
    let path = std::path::Path::new(asset_path);
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    ext == filter || crate::scanner::guess_mime(path).starts_with(filter)
}

/// A search result row: the denormalized hit plus the current annotation's
/// highlights when one exists.
fn render_hit(state: &AppState, hit: SearchHit) -> AppResult<Value> {
    let anchor: Value = serde_json::from_str(&hit.anchor_json).unwrap_or(Value::Null);
    let mut row = json!({
        "chunk_id": hit.chunk_id,
        "score": hit.score,
        "text": hit.text,
        "asset_id": hit.asset_id,
        "asset_path": hit.asset_path,
        "evidence_anchor": anchor,
    });

    if let Some(annotation) = state.store.get_current_annotation(&hit.chunk_id)? {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("topics".to_string(), json!(annotation.payload.topics));
            obj.insert("summary".to_string(), json!(annotation.payload.summary));
            obj.insert("sentiment".to_string(), json!(annotation.payload.sentiment));
            obj.insert("entities".to_string(), json!(annotation.payload.entities));
        }
    }
    Ok(row)
}
