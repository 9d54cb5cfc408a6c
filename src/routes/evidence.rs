//! Evidence endpoints: resolve chunks and assets back to their source files
//! so the UI can show provenance for any search hit or concept member.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::model::Asset;
use crate::state::AppState;

fn asset_summary(asset: &Asset) -> Value {
    let mut row = json!({
        "id": asset.id,
        "path": asset.path,
        "filename": asset.filename,
        "size_bytes": asset.size_bytes,
        "mime_type": asset.mime_type,
        "status": asset.status,
        "scan_version": asset.scan_version,
        "updated_at": asset.updated_at,
    });
    if asset.last_error.is_some() {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("last_error".to_string(), json!(asset.last_error));
        }
    }
    row
}

pub async fn all_assets(State(state): State<AppState>) -> AppResult<Json<Vec<Value>>> {
    let assets = state.store.list_all_assets()?;
    Ok(Json(assets.iter().map(asset_summary).collect()))
}

pub async fn asset_evidence(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> AppResult<Json<Value>> {
    let asset = state
        .store
        .get_asset(&asset_id)?
        .ok_or_else(|| AppError::NotFound(format!("asset {}", asset_id)))?;

    let mut row = asset_summary(&asset);
    if let Some(obj) = row.as_object_mut() {
        obj.insert(
            "exists".to_string(),
            json!(std::path::Path::new(&asset.path).exists()),
        );
    }
    Ok(Json(row))
}

pub async fn chunk_evidence(
    State(state): State<AppState>,
    Path(chunk_id): Path<String>,
) -> AppResult<Json<Value>> {
    let chunk = state
        .store
        .get_chunk(&chunk_id)?
        .ok_or_else(|| AppError::NotFound(format!("chunk {}", chunk_id)))?;
    let asset = state
        .store
        .get_asset(&chunk.asset_id)?
        .ok_or_else(|| AppError::NotFound(format!("asset {}", chunk.asset_id)))?;

    let mut row = asset_summary(&asset);
    if let Some(obj) = row.as_object_mut() {
        obj.insert("chunk_id".to_string(), json!(chunk.id));
        obj.insert("chunk_text".to_string(), json!(chunk.text));
        obj.insert("token_count".to_string(), json!(chunk.token_count));
        obj.insert("evidence_anchor".to_string(), json!(chunk.anchor));
    }
    Ok(Json(row))
}

pub async fn chunk_annotation(
    State(state): State<AppState>,
    Path(chunk_id): Path<String>,
) -> AppResult<Json<Value>> {
    let annotation = state
        .store
        .get_current_annotation(&chunk_id)?
        .ok_or_else(|| AppError::NotFound(format!("annotation for chunk {}", chunk_id)))?;
    Ok(Json(json!({
        "id": annotation.id,
        "chunk_id": annotation.chunk_id,
        "model_id": annotation.model_id,
        "prompt_id": annotation.prompt_id,
        "prompt_version": annotation.prompt_version,
        "pipeline_version": annotation.pipeline_version,
        "annotation": annotation.payload,
        "created_at": annotation.created_at,
    })))
}
