use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    // The desktop UI runs on a file:// origin; anything goes. OPTIONS
    // preflights are answered inside the CORS layer without reaching a
    // handler.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        // Watched volumes
        .route("/volumes/add", post(routes::volumes::add_volume))
        .route("/volumes/list", get(routes::volumes::list_volumes))
        .route("/volumes/remove", delete(routes::volumes::remove_volume))
        // Pipeline
        .route("/ingest/start", post(routes::ingest::start_ingest))
        .route("/ingest/status", get(routes::ingest::ingest_status))
        .route("/ingest/cancel", post(routes::ingest::cancel_ingest))
        // Search
        .route("/search", post(routes::search::search))
        .route("/search/quick", get(routes::search::quick_search))
        // Evidence
        .route("/evidence/assets/all", get(routes::evidence::all_assets))
        .route(
            "/evidence/chunk/{chunk_id}/annotation",
            get(routes::evidence::chunk_annotation),
        )
        .route(
            "/evidence/chunk/{chunk_id}",
            get(routes::evidence::chunk_evidence),
        )
        .route("/evidence/{asset_id}", get(routes::evidence::asset_evidence))
        // Universe projection
        .route("/universe/snapshot", get(routes::universe::snapshot))
        .route("/universe/focus", post(routes::universe::focus))
        // Concepts
        .route("/concepts/list", get(routes::concepts::list_concepts))
        .route("/concepts/refine", post(routes::concepts::refine_concept))
        .route("/concepts/{id}/why", get(routes::concepts::concept_why))
        .route("/concepts/{id}", get(routes::concepts::get_concept))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
