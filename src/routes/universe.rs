//! Universe snapshot: a read-only projection of concepts, chunks, and edges
//! for the 3D visualization client. The level of detail controls which node
//! classes are included.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::model::EdgeType;
use crate::state::AppState;

/// Edge budget per snapshot so a dense similarity graph cannot flood the
/// renderer.
const MAX_SNAPSHOT_EDGES: usize = 5000;

/// Chunk text carried at the near level, truncated.
const CHUNK_LABEL_CHARS: usize = 120;

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default = "default_lod")]
    pub lod: String,
}

fn default_lod() -> String {
    "macro".to_string()
}

#[derive(Debug, Deserialize)]
pub struct FocusQuery {
    pub node_id: String,
}

pub async fn snapshot(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> AppResult<Json<Value>> {
    let lod = query.lod.as_str();
    if !matches!(lod, "macro" | "mid" | "near") {
        return Err(AppError::BadRequest(format!("unknown lod: {}", lod)));
    }

    let mut nodes: Vec<Value> = Vec::new();
    let mut edges: Vec<Value> = Vec::new();

    let concepts = state.store.list_concepts(None)?;
    for concept in &concepts {
        nodes.push(json!({
            "id": concept.id,
            "kind": "concept",
            "label": concept.label,
            "level": concept.level,
            "parent_id": concept.parent_id,
        }));
    }
    for edge in state
        .store
        .list_edges(Some(EdgeType::ParentChild), MAX_SNAPSHOT_EDGES)?
    {
        edges.push(render_edge(&edge));
    }

    if lod == "mid" || lod == "near" {
        // Chunk nodes enter at mid; membership edges tie them to concepts.
        let (chunk_ids, _, texts) = state.store.vectors_get_all();
        for (i, chunk_id) in chunk_ids.iter().enumerate() {
            let label: String = if lod == "near" {
                texts[i].chars().take(CHUNK_LABEL_CHARS).collect()
            } else {
                String::new()
            };
            nodes.push(json!({
                "id": chunk_id,
                "kind": "chunk",
                "label": label,
            }));
        }
        for edge in state
            .store
            .list_edges(Some(EdgeType::ConceptMember), MAX_SNAPSHOT_EDGES)?
        {
            edges.push(render_edge(&edge));
        }
    }

    if lod == "near" {
        let remaining = MAX_SNAPSHOT_EDGES.saturating_sub(edges.len());
        for edge in state
            .store
            .list_edges(Some(EdgeType::Similarity), remaining)?
        {
            edges.push(render_edge(&edge));
        }
    }

    Ok(Json(json!({
        "lod": lod,
        "node_count": nodes.len(),
        "edge_count": edges.len(),
        "nodes": nodes,
        "edges": edges,
    })))
}

/// Neighborhood of one node: the node itself, every incident edge, and the
/// nodes on the far end.
pub async fn focus(
    State(state): State<AppState>,
    Query(query): Query<FocusQuery>,
) -> AppResult<Json<Value>> {
    let node_id = &query.node_id;
    let center = resolve_node(&state, node_id)?
        .ok_or_else(|| AppError::NotFound(format!("node {}", node_id)))?;

    let incident = state.store.edges_for_node(node_id)?;
    let mut nodes = vec![center];
    let mut edges = Vec::with_capacity(incident.len());
    for edge in &incident {
        let other = if edge.source_id == *node_id {
            &edge.target_id
        } else {
            &edge.source_id
        };
        if let Some(node) = resolve_node(&state, other)? {
            nodes.push(node);
        }
        edges.push(render_edge(edge));
    }

    Ok(Json(json!({
        "node_id": node_id,
        "node_count": nodes.len(),
        "edge_count": edges.len(),
        "nodes": nodes,
        "edges": edges,
    })))
}

fn render_edge(edge: &crate::model::GraphEdge) -> Value {
    json!({
        "id": edge.id,
        "type": edge.edge_type,
        "source": edge.source_id,
        "target": edge.target_id,
        "weight": edge.weight,
    })
}

/// A node id names either a concept or a chunk.
fn resolve_node(state: &AppState, node_id: &str) -> AppResult<Option<Value>> {
    if let Some(concept) = state.store.get_concept(node_id)? {
        return Ok(Some(json!({
            "id": concept.id,
            "kind": "concept",
            "label": concept.label,
            "level": concept.level,
        })));
    }
    if let Some(chunk) = state.store.get_chunk(node_id)? {
        let label: String = chunk.text.chars().take(CHUNK_LABEL_CHARS).collect();
        return Ok(Some(json!({
            "id": chunk.id,
            "kind": "chunk",
            "label": label,
            "asset_id": chunk.asset_id,
        })));
    }
    Ok(None)
}
