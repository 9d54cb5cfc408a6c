use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::llm::LlmClient;
use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the uptime counter (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);

    let models = state.llm.list_models().await.unwrap_or_default();
    let lm_studio = !models.is_empty();
    let chat_model = LlmClient::pick_chat_model(&models);
    let embedding_model = LlmClient::pick_embedding_model(&models);
    let context_length = if lm_studio {
        Some(state.llm.context_length().await)
    } else {
        None
    };

    Ok(Json(json!({
        "status": "ok",
        "lm_studio": lm_studio,
        "vector_count": state.store.vector_count(),
        "db": state.config.db_path().to_string_lossy(),
        "chat_model": chat_model,
        "embedding_model": embedding_model,
        "data_dir": state.config.data_dir,
        "port": state.config.port,
        "watched_volumes": state.store.list_watched_roots()?.len(),
        "context_length": context_length,
        "uptime": uptime,
    })))
}
