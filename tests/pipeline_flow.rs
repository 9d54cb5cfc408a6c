//! End-to-end pipeline test: a three-file corpus runs through all six
//! stages against a mock inference server, then re-runs to prove
//! idempotence.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use knowledge_refinery::config::AppConfig;
use knowledge_refinery::llm::LlmClient;
use knowledge_refinery::model::{AssetStatus, EdgeType, JobStatus, PipelineJob};
use knowledge_refinery::pipeline::Pipeline;
use knowledge_refinery::store::Store;

const CANNED_ANNOTATION: &str = r#"{"topics":["t"],"sentiment":{"label":"neutral","confidence":0.5},"entities":[],"claims":[],"summary":"s","quality_flags":[]}"#;

/// Serve an OpenAI-compatible mock on an ephemeral port; returns its base
/// URL (with the /v1 suffix).
async fn spawn_mock_llm() -> String {
    async fn models() -> Json<Value> {
        Json(json!({"data": [
            {"id": "test-chat-model"},
            {"id": "test-embed-nomic"},
        ]}))
    }

    async fn ext_models() -> Json<Value> {
        Json(json!({"data": [
            {"id": "test-chat-model", "type": "llm", "loaded_context_length": 8192},
        ]}))
    }

    async fn embeddings(Json(body): Json<Value>) -> Json<Value> {
        let n = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
        let data: Vec<Value> = (0..n)
            .map(|_| json!({"embedding": [0.1, 0.2, 0.3, 0.4]}))
            .collect();
        Json(json!({"data": data}))
    }

    async fn chat(Json(body): Json<Value>) -> Json<Value> {
        let system = body["messages"][0]["content"].as_str().unwrap_or("");
        let content = if system.contains("document analyst") {
            CANNED_ANNOTATION.to_string()
        } else if system.contains("name clusters") {
            r#"{"label":"Test Cluster","description":"a test cluster","keywords":["test"]}"#
                .to_string()
        } else {
            "These passages share a theme.".to_string()
        };
        Json(json!({"choices": [{"message": {"content": content}}]}))
    }

    let app = Router::new()
        .route("/v1/models", get(models))
        .route("/api/v0/models", get(ext_models))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/chat/completions", post(chat));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn write_corpus(dir: &std::path::Path) {
    std::fs::write(
        dir.join("a.txt"),
        "The mitochondria is the powerhouse of the cell.",
    )
    .unwrap();
    std::fs::write(
        dir.join("b.md"),
        "# Neural Networks\n\nNeurons connect via weighted edges.",
    )
    .unwrap();
    std::fs::write(
        dir.join("c.html"),
        "<html><body><p>Hello <b>world</b>!</p></body></html>",
    )
    .unwrap();
}

async fn run_pipeline(pipeline: &Pipeline, store: &Store, job_id: &str) {
    let now = Utc::now();
    store
        .upsert_job(&PipelineJob {
            id: job_id.to_string(),
            job_type: "ingest".to_string(),
            status: JobStatus::Running,
            progress: json!({"stage": "starting"}),
            created_at: now,
            updated_at: now,
        })
        .unwrap();
    pipeline.run(job_id, None).await.unwrap();
}

#[tokio::test]
async fn fresh_ingest_runs_all_six_stages() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path());
    let data_dir = tempfile::tempdir().unwrap();

    let base_url = spawn_mock_llm().await;
    let store = Arc::new(Store::open(&data_dir.path().join("refinery.db")).unwrap());
    let llm = Arc::new(LlmClient::new(&base_url, 10).unwrap());
    let mut config = AppConfig::from_env();
    config.data_dir = data_dir.path().to_string_lossy().to_string();
    config.lm_studio_url = base_url.clone();
    let pipeline = Pipeline::new(store.clone(), llm.clone(), config).with_fast_mode();

    store
        .add_watched_root(&corpus.path().to_string_lossy(), "corpus")
        .unwrap();
    run_pipeline(&pipeline, &store, "job1").await;

    // Three assets end in status = annotated.
    let annotated = store.list_assets_by_status(AssetStatus::Annotated).unwrap();
    assert_eq!(annotated.len(), 3);

    // Three chunks, three vectors, three current annotations.
    assert_eq!(store.count_chunks().unwrap(), 3);
    assert_eq!(store.vector_count(), 3);
    assert_eq!(store.count_current_annotations().unwrap(), 3);

    // All vectors identical → one populated cluster holding all 3 members.
    assert!(store.count_concepts().unwrap() >= 1);
    let member_edges = store
        .list_edges(Some(EdgeType::ConceptMember), 100)
        .unwrap();
    assert_eq!(member_edges.len(), 3);

    // Similarity edges: 3 × min(k_nn = 5, n − 1 = 2) = 6.
    let similarity_edges = store.list_edges(Some(EdgeType::Similarity), 100).unwrap();
    assert_eq!(similarity_edges.len(), 6);

    // Job record reached the terminal stage.
    let job = store.get_latest_job(Some("ingest")).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress["stage"], "completed");

    // Search returns ordered hits against the warm cache.
    let model = llm.embedding_model().await.unwrap();
    let query: Vec<f32> = llm
        .embed_single("powerhouse", &model)
        .await
        .unwrap()
        .into_iter()
        .map(|x| x as f32)
        .collect();
    let hits = store.search_vectors(&query, 10);
    assert_eq!(hits.len(), 3);
    assert!(hits.windows(2).all(|w| w[0].score <= w[1].score));

    // Second run on an unchanged corpus is a no-op in table content.
    run_pipeline(&pipeline, &store, "job2").await;
    assert_eq!(store.count_chunks().unwrap(), 3);
    assert_eq!(store.vector_count(), 3);
    assert_eq!(store.count_current_annotations().unwrap(), 3);
    assert_eq!(
        store
            .list_assets_by_status(AssetStatus::Annotated)
            .unwrap()
            .len(),
        3
    );

    let job = store.get_latest_job(Some("ingest")).unwrap().unwrap();
    assert_eq!(job.id, "job2");
    assert_eq!(job.status, JobStatus::Completed);
    let scan = &job.progress["scan"];
    assert_eq!(scan["unchanged"], 3);
    assert_eq!(scan["new"], 0);
    assert_eq!(scan["updated"], 0);
}

#[tokio::test]
async fn offline_llm_degrades_gracefully() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path());
    let data_dir = tempfile::tempdir().unwrap();

    // Nothing listens here: every LLM call fails fast.
    let store = Arc::new(Store::open(&data_dir.path().join("refinery.db")).unwrap());
    let llm = Arc::new(LlmClient::new("http://127.0.0.1:9", 1).unwrap());
    let mut config = AppConfig::from_env();
    config.data_dir = data_dir.path().to_string_lossy().to_string();
    let pipeline = Pipeline::new(store.clone(), llm, config).with_fast_mode();

    store
        .add_watched_root(&corpus.path().to_string_lossy(), "corpus")
        .unwrap();
    run_pipeline(&pipeline, &store, "job-offline").await;

    // Scan, extract, and chunk still complete; the LLM-backed stages
    // degrade to zero output instead of failing the run.
    assert_eq!(
        store
            .list_assets_by_status(AssetStatus::Chunked)
            .unwrap()
            .len(),
        3
    );
    assert_eq!(store.count_chunks().unwrap(), 3);
    assert_eq!(store.vector_count(), 0);
    assert_eq!(store.count_current_annotations().unwrap(), 0);
    assert_eq!(store.count_concepts().unwrap(), 0);

    let job = store.get_latest_job(None).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}
