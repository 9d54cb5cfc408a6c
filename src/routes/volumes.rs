use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::model::WatchedRoot;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddVolumeRequest {
    pub path: String,
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveVolumeQuery {
    pub path: String,
}

pub async fn add_volume(
    State(state): State<AppState>,
    Json(req): Json<AddVolumeRequest>,
) -> AppResult<Json<WatchedRoot>> {
    let canonical = dunce::canonicalize(&req.path)
        .map_err(|_| AppError::BadRequest(format!("path does not exist: {}", req.path)))?;
    if !canonical.is_dir() {
        return Err(AppError::BadRequest(format!(
            "not a directory: {}",
            req.path
        )));
    }

    let path = canonical.to_string_lossy().to_string();
    let label = req.label.unwrap_or_else(|| {
        canonical
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone())
    });
    let root = state.store.add_watched_root(&path, &label)?;
    Ok(Json(root))
}

pub async fn list_volumes(State(state): State<AppState>) -> AppResult<Json<Vec<WatchedRoot>>> {
    Ok(Json(state.store.list_watched_roots()?))
}

pub async fn remove_volume(
    State(state): State<AppState>,
    Query(query): Query<RemoveVolumeQuery>,
) -> AppResult<Json<Value>> {
    if !state.store.remove_watched_root(&query.path)? {
        return Err(AppError::NotFound(format!(
            "watched volume {}",
            query.path
        )));
    }
    Ok(Json(json!({"status": "removed", "path": query.path})))
}
