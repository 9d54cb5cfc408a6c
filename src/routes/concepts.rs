//! Concept endpoints: listing, detail with truncated members, an LLM-backed
//! "why" explanation, and on-demand sub-cluster refinement.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::concepts::ConceptBuilder;
use crate::error::{AppError, AppResult};
use crate::llm::ChatMessage;
use crate::model::ConceptNode;
use crate::state::AppState;

const MAX_DETAIL_MEMBERS: usize = 20;
const MEMBER_TRUNCATE_CHARS: usize = 200;
const DEFAULT_SUBCLUSTERS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub level: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RefineQuery {
    pub concept_id: String,
    #[serde(default)]
    pub n_sub: Option<usize>,
}

fn concept_summary(state: &AppState, concept: &ConceptNode) -> AppResult<Value> {
    let member_count = state.store.concept_member_chunk_ids(&concept.id)?.len();
    Ok(json!({
        "id": concept.id,
        "level": concept.level,
        "label": concept.label,
        "description": concept.description,
        "parent_id": concept.parent_id,
        "member_count": member_count,
        "model_id": concept.model_id,
    }))
}

pub async fn list_concepts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Value>>> {
    let concepts = state.store.list_concepts(query.level)?;
    let mut rows = Vec::with_capacity(concepts.len());
    for concept in &concepts {
        rows.push(concept_summary(&state, concept)?);
    }
    Ok(Json(rows))
}

pub async fn get_concept(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let concept = state
        .store
        .get_concept(&id)?
        .ok_or_else(|| AppError::NotFound(format!("concept {}", id)))?;

    let member_ids = state.store.concept_member_chunk_ids(&id)?;
    let mut members = Vec::new();
    for chunk_id in member_ids.iter().take(MAX_DETAIL_MEMBERS) {
        if let Some(chunk) = state.store.get_chunk(chunk_id)? {
            let text: String = chunk.text.chars().take(MEMBER_TRUNCATE_CHARS).collect();
            members.push(json!({
                "chunk_id": chunk.id,
                "asset_id": chunk.asset_id,
                "text": text,
            }));
        }
    }

    let mut row = concept_summary(&state, &concept)?;
    if let Some(obj) = row.as_object_mut() {
        obj.insert(
            "exemplar_chunk_ids".to_string(),
            json!(concept.exemplar_chunk_ids),
        );
        obj.insert("members".to_string(), json!(members));
    }
    Ok(Json(row))
}

/// Explain a concept from its exemplars. The explanation degrades to a
/// canned sentence when the chat model is unavailable.
pub async fn concept_why(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let concept = state
        .store
        .get_concept(&id)?
        .ok_or_else(|| AppError::NotFound(format!("concept {}", id)))?;

    let mut exemplars = Vec::new();
    for chunk_id in &concept.exemplar_chunk_ids {
        if let Some(chunk) = state.store.get_chunk(chunk_id)? {
            exemplars.push(json!({
                "chunk_id": chunk.id,
                "asset_id": chunk.asset_id,
                "text": chunk.text,
            }));
        }
    }

    let explanation = explain(&state, &concept, &exemplars).await;
    let mut row = concept_summary(&state, &concept)?;
    if let Some(obj) = row.as_object_mut() {
        obj.insert("exemplars".to_string(), json!(exemplars));
        obj.insert("explanation".to_string(), json!(explanation));
    }
    Ok(Json(row))
}

async fn explain(state: &AppState, concept: &ConceptNode, exemplars: &[Value]) -> String {
    let fallback = format!(
        "These passages cluster together as \"{}\": {}",
        concept.label, concept.description
    );
    let Ok(model) = state.llm.chat_model().await else {
        return fallback;
    };

    let passages = exemplars
        .iter()
        .filter_map(|e| e.get("text").and_then(|t| t.as_str()))
        .enumerate()
        .map(|(i, text)| {
            let short: String = text.chars().take(500).collect();
            format!("Passage {}:\n{}", i + 1, short)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let messages = [
        ChatMessage::system(
            "Explain in two or three sentences why the following passages form a \
             coherent group. Address the user directly; no JSON, no preamble.",
        ),
        ChatMessage::user(format!(
            "Cluster label: {}\n\n{}",
            concept.label, passages
        )),
    ];
    match state.llm.chat(&messages, &model, 0.4, 256).await {
        Ok(reply) if !reply.is_empty() => reply,
        _ => fallback,
    }
}

pub async fn refine_concept(
    State(state): State<AppState>,
    Query(query): Query<RefineQuery>,
) -> AppResult<Json<Vec<Value>>> {
    let n_sub = query.n_sub.unwrap_or(DEFAULT_SUBCLUSTERS);
    if n_sub == 0 {
        return Err(AppError::BadRequest("n_sub must be positive".to_string()));
    }
    let builder = ConceptBuilder::new(state.store.clone(), state.llm.clone());
    let children = builder.refine_concept(&query.concept_id, n_sub).await?;

    let mut rows = Vec::with_capacity(children.len());
    for child in &children {
        rows.push(concept_summary(&state, child)?);
    }
    Ok(Json(rows))
}
