use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartIngestRequest {
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

/// Kick off a pipeline run in the background worker. 409 when one is
/// already active. The body is optional; an absent or empty body scans the
/// watched roots.
pub async fn start_ingest(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> AppResult<Json<Value>> {
    let paths = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<StartIngestRequest>(&body)
            .map_err(|e| AppError::BadRequest(format!("malformed JSON body: {}", e)))?
            .paths
    };
    let job_id = state.pipeline.start_run(paths)?;
    Ok(Json(json!({"job_id": job_id, "status": "started"})))
}

pub async fn ingest_status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(state.pipeline.status_snapshot()?))
}

/// Deliver a cancellation signal to the active run; the worker stops at the
/// next stage or item boundary.
pub async fn cancel_ingest(State(state): State<AppState>) -> AppResult<Json<Value>> {
    if !state.pipeline.request_cancel() {
        return Err(AppError::Conflict("no pipeline run is active".to_string()));
    }
    Ok(Json(json!({"status": "cancelling"})))
}
