//! Pipeline orchestrator: drives the six ingestion stages in sequence and
//! reports live progress.
//!
//! Exactly one run may be active per daemon instance, enforced by an atomic
//! compare-and-swap with a scope guard that clears the flag on every exit
//! path, panics included. Stage transitions persist progress to the job
//! record so a crash leaves a resumable store; the live map and activity
//! ring live in memory only.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::annotator::Annotator;
use crate::chunker::Chunker;
use crate::concepts::ConceptBuilder;
use crate::config::AppConfig;
use crate::embedder::Embedder;
use crate::error::{AppError, AppResult};
use crate::extract::ExtractorRegistry;
use crate::ids;
use crate::llm::LlmClient;
use crate::model::{AssetStatus, JobStatus, PipelineJob};
use crate::scanner::{self, ScanCounters};
use crate::store::Store;

/// Activity ring capacity.
const ACTIVITY_CAPACITY: usize = 200;

/// Entries returned to clients, oldest first.
const ACTIVITY_EXPOSED: usize = 50;

/// k for the similarity graph built at the end of every run.
const SIMILARITY_K: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub ts: DateTime<Utc>,
    pub stage: String,
    pub action: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<Value>,
}

pub struct Pipeline {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    config: AppConfig,
    registry: ExtractorRegistry,
    running: AtomicBool,
    cancel: AtomicBool,
    current_job_id: Mutex<Option<String>>,
    /// Whole-value-swapped map with exactly one key: the current stage.
    live: RwLock<Value>,
    activity: Mutex<VecDeque<ActivityEntry>>,
    fast_mode: bool,
}

/// Clears the running and cancel flags on every exit path.
struct RunGuard<'a>(&'a Pipeline);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.cancel.store(false, Ordering::SeqCst);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl Pipeline {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>, config: AppConfig) -> Self {
        Self {
            store,
            llm,
            config,
            registry: ExtractorRegistry::with_defaults(),
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            current_job_id: Mutex::new(None),
            live: RwLock::new(Value::Null),
            activity: Mutex::new(VecDeque::with_capacity(ACTIVITY_CAPACITY)),
            fast_mode: false,
        }
    }

    /// Collapse annotation backoffs and inter-chunk pauses; test harness use.
    pub fn with_fast_mode(mut self) -> Self {
        self.fast_mode = true;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn current_job_id(&self) -> Option<String> {
        self.current_job_id.lock().clone()
    }

    /// Request cancellation of the active run. The worker observes the flag
    /// between stages and between per-item iterations.
    pub fn request_cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Start a pipeline run in a background worker. Fails with a conflict
    /// when one is already active.
    pub fn start_run(self: &Arc<Self>, paths: Option<Vec<String>>) -> AppResult<String> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Conflict("a pipeline run is already active".to_string()));
        }

        let job_id = ids::new_job_id();
        let now = Utc::now();
        let job = PipelineJob {
            id: job_id.clone(),
            job_type: "ingest".to_string(),
            status: JobStatus::Running,
            progress: json!({"stage": "starting"}),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.upsert_job(&job) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        *self.current_job_id.lock() = Some(job_id.clone());

        let pipeline = self.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            let guard = RunGuard(&pipeline);
            match pipeline.run(&worker_job_id, paths).await {
                Ok(()) => {}
                Err(e) => {
                    error!(job = %worker_job_id, error = %e, "pipeline run failed");
                    let progress = json!({"stage": "failed", "error": e.to_string()});
                    let _ = pipeline
                        .store
                        .update_job(&worker_job_id, JobStatus::Failed, &progress);
                }
            }
            drop(guard);
        });

        info!(job = %job_id, "pipeline run started");
        Ok(job_id)
    }

    /// Execute one run synchronously; used by the worker task and by tests
    /// that want to await completion.
    pub async fn run(&self, job_id: &str, paths: Option<Vec<String>>) -> AppResult<()> {
        let mut scan = ScanCounters::default();

        // Stage 1: scan
        self.swap_live(json!({"scan": {"status": "walking roots"}}));
        let roots: Vec<String> = match paths {
            Some(paths) if !paths.is_empty() => paths,
            _ => self
                .store
                .list_watched_roots()?
                .into_iter()
                .map(|r| r.path)
                .collect(),
        };
        for root in &roots {
            if self.cancelled() {
                return self.finish_cancelled(job_id);
            }
            match scanner::scan_path(&self.store, Path::new(root), self.config.max_file_size_bytes)
            {
                Ok(counters) => {
                    scan.merge(&counters);
                    self.store.touch_root_scanned(root)?;
                    self.log_activity(
                        "scan",
                        "scanned",
                        root,
                        Some(serde_json::to_value(counters)?),
                    );
                }
                Err(e) => {
                    warn!(root = %root, error = %e, "scan failed for root");
                    scan.errors += 1;
                    self.log_activity("scan", "scan_failed", &format!("{}: {}", root, e), None);
                }
            }
        }
        self.persist_progress(
            job_id,
            json!({"stage": "scanning", "scan": serde_json::to_value(scan)?}),
        )?;

        // Stage 2: extract
        let pending = self.store.list_assets_by_status(AssetStatus::Pending)?;
        let total = pending.len();
        let mut extracted = 0usize;
        let mut extract_errors = 0usize;
        for (done, asset) in pending.iter().enumerate() {
            if self.cancelled() {
                return self.finish_cancelled(job_id);
            }
            self.swap_live(json!({"extract": {
                "current_file": asset.filename,
                "done": done,
                "total": total,
            }}));

            // Stale downstream state goes first so a re-extract starts clean.
            self.store.delete_asset_dependents(&asset.id)?;
            match self.registry.extract(asset) {
                Ok(extraction) => {
                    if !extraction.atoms.is_empty() {
                        self.store.insert_atoms(&extraction.atoms)?;
                    }
                    match extraction.violation {
                        Some(violation) => {
                            self.store.update_asset_status(
                                &asset.id,
                                AssetStatus::Error,
                                Some(&violation),
                            )?;
                            extract_errors += 1;
                            self.log_activity("extract", "archive_abandoned", &asset.path, None);
                        }
                        None => {
                            self.store
                                .update_asset_status(&asset.id, AssetStatus::Extracted, None)?;
                            extracted += 1;
                            self.log_activity(
                                "extract",
                                "extracted",
                                &asset.filename,
                                Some(json!({"atoms": extraction.atoms.len()})),
                            );
                        }
                    }
                }
                Err(e) => {
                    self.store.update_asset_status(
                        &asset.id,
                        AssetStatus::Error,
                        Some(&e.to_string()),
                    )?;
                    extract_errors += 1;
                    self.log_activity("extract", "extract_failed", &asset.path, None);
                }
            }
        }
        self.persist_progress(
            job_id,
            json!({"stage": "extracting", "extracted": extracted, "errors": extract_errors}),
        )?;

        // Stage 3: chunk
        let mut chunker = Chunker::new();
        chunker.adapt_to_context(self.llm.context_length().await);
        let extracted_assets = self.store.list_assets_by_status(AssetStatus::Extracted)?;
        let total = extracted_assets.len();
        let mut chunk_count = 0usize;
        for (done, asset) in extracted_assets.iter().enumerate() {
            if self.cancelled() {
                return self.finish_cancelled(job_id);
            }
            self.swap_live(json!({"chunk": {"done": done, "total": total}}));
            let atoms = self.store.list_atoms_by_asset(&asset.id)?;
            let chunks = chunker.chunk_atoms(asset, &atoms);
            if !chunks.is_empty() {
                self.store.insert_chunks(&chunks)?;
            }
            chunk_count += chunks.len();
            self.store
                .update_asset_status(&asset.id, AssetStatus::Chunked, None)?;
        }
        self.log_activity(
            "chunk",
            "chunked",
            &format!("{} assets", total),
            Some(json!({"chunks": chunk_count})),
        );
        self.persist_progress(job_id, json!({"stage": "chunking", "chunks": chunk_count}))?;

        // Stage 4: embed
        if self.cancelled() {
            return self.finish_cancelled(job_id);
        }
        let unembedded = self.store.list_unembedded_chunks()?;
        let embedder = Embedder::new(
            self.store.clone(),
            self.llm.clone(),
            self.config.embed_batch_size,
        );
        let embedded = embedder
            .embed_chunks(&unembedded, |done, total| {
                self.swap_live(json!({"embed": {"embedded": done, "total": total}}));
            })
            .await?;
        for asset in self.store.list_assets_by_status(AssetStatus::Chunked)? {
            if self.store.asset_fully_embedded(&asset.id)? {
                self.store
                    .update_asset_status(&asset.id, AssetStatus::Embedded, None)?;
            }
        }
        self.log_activity(
            "embed",
            "embedded",
            &format!("{} of {} chunks", embedded, unembedded.len()),
            None,
        );
        self.persist_progress(job_id, json!({"stage": "embedding", "embedded": embedded}))?;

        // Stage 5: annotate
        let mut annotated_total = 0usize;
        let mut annotation_failures = 0usize;
        match self.llm.chat_model().await {
            Err(e) => {
                warn!(error = %e, "no chat model; annotate stage skipped");
                self.log_activity("annotate", "skipped", "inference server unavailable", None);
            }
            Ok(model) => {
                let mut annotator = Annotator::new(self.store.clone(), self.llm.clone());
                if self.fast_mode {
                    annotator = annotator.with_fast_mode();
                }
                // Annotated assets are revisited too: chunks that failed in a
                // prior pass are retried, already-covered chunks are skipped.
                let mut embedded_assets = self.store.list_assets_by_status(AssetStatus::Embedded)?;
                embedded_assets.extend(self.store.list_assets_by_status(AssetStatus::Annotated)?);
                for asset in &embedded_assets {
                    if self.cancelled() {
                        return self.finish_cancelled(job_id);
                    }
                    let chunks = self.store.list_chunks_by_asset(&asset.id)?;
                    self.swap_live(json!({"annotate": {
                        "current_file": asset.filename,
                        "annotated": annotated_total,
                    }}));
                    let outcome = annotator.annotate_chunks(&model, &chunks, &self.cancel).await?;
                    annotated_total += outcome.annotated;
                    annotation_failures += outcome.failed;
                    if outcome.annotated > 0 {
                        self.store
                            .update_asset_status(&asset.id, AssetStatus::Annotated, None)?;
                    }
                    self.log_activity(
                        "annotate",
                        "annotated",
                        &asset.filename,
                        Some(json!({
                            "annotated": outcome.annotated,
                            "skipped": outcome.skipped,
                            "failed": outcome.failed,
                        })),
                    );
                }
            }
        }
        self.persist_progress(
            job_id,
            json!({"stage": "annotating", "annotated": annotated_total, "failed": annotation_failures}),
        )?;

        // Stage 6: conceptualize
        if self.cancelled() {
            return self.finish_cancelled(job_id);
        }
        self.swap_live(json!({"conceptualize": {"status": "clustering"}}));
        let mut builder = ConceptBuilder::new(self.store.clone(), self.llm.clone());
        if self.fast_mode {
            builder = builder.with_fast_mode();
        }
        let concepts = builder.build_concepts(0, None).await?;
        let similarity_edges = builder.build_similarity_graph(SIMILARITY_K)?;
        self.swap_live(json!({"conceptualize": {
            "status": "done",
            "concepts": concepts.len(),
        }}));
        self.log_activity(
            "conceptualize",
            "built",
            &format!("{} concepts, {} similarity edges", concepts.len(), similarity_edges),
            None,
        );

        let progress = json!({
            "stage": "completed",
            "completed_at": Utc::now().to_rfc3339(),
            "scan": serde_json::to_value(scan)?,
            "chunks": chunk_count,
            "embedded": embedded,
            "annotated": annotated_total,
            "annotation_failures": annotation_failures,
            "concepts": concepts.len(),
            "similarity_edges": similarity_edges,
        });
        self.store
            .update_job(job_id, JobStatus::Completed, &progress)?;
        info!(job = %job_id, "pipeline run completed");
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn finish_cancelled(&self, job_id: &str) -> AppResult<()> {
        let progress = json!({"stage": "cancelled", "error": "cancelled"});
        self.store.update_job(job_id, JobStatus::Failed, &progress)?;
        self.log_activity("pipeline", "cancelled", job_id, None);
        info!(job = %job_id, "pipeline run cancelled");
        Ok(())
    }

    fn persist_progress(&self, job_id: &str, progress: Value) -> AppResult<()> {
        self.store.update_job(job_id, JobStatus::Running, &progress)
    }

    fn swap_live(&self, value: Value) {
        *self.live.write() = value;
    }

    pub fn live_snapshot(&self) -> Value {
        self.live.read().clone()
    }

    pub fn log_activity(&self, stage: &str, action: &str, detail: &str, counts: Option<Value>) {
        let mut log = self.activity.lock();
        if log.len() == ACTIVITY_CAPACITY {
            log.pop_front();
        }
        log.push_back(ActivityEntry {
            ts: Utc::now(),
            stage: stage.to_string(),
            action: action.to_string(),
            detail: detail.to_string(),
            counts,
        });
    }

    /// Most recent activity entries in chronological order.
    pub fn recent_activity(&self) -> Vec<ActivityEntry> {
        let log = self.activity.lock();
        log.iter()
            .skip(log.len().saturating_sub(ACTIVITY_EXPOSED))
            .cloned()
            .collect()
    }

    /// Aggregate ingest status: counters refreshed from the store, plus the
    /// in-memory live map and activity log.
    pub fn status_snapshot(&self) -> AppResult<Value> {
        let status_counts: serde_json::Map<String, Value> = self
            .store
            .count_assets_by_status()?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), json!(count)))
            .collect();

        Ok(json!({
            "running": self.is_running(),
            "current_job_id": self.current_job_id(),
            "total_assets": self.store.count_assets()?,
            "status_counts": status_counts,
            "latest_job": self.store.get_latest_job(Some("ingest"))?,
            "vector_count": self.store.vector_count(),
            "chunk_count": self.store.count_chunks()?,
            "annotation_count": self.store.count_current_annotations()?,
            "concept_count": self.store.count_concepts()?,
            "edge_count": self.store.count_edges()?,
            "live": self.live_snapshot(),
            "activity_log": self.recent_activity(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipeline() -> Arc<Pipeline> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(LlmClient::new("http://127.0.0.1:1", 1).unwrap());
        let mut config = AppConfig::from_env();
        config.max_file_size_bytes = 1024 * 1024;
        Arc::new(Pipeline::new(store, llm, config).with_fast_mode())
    }

    #[test]
    fn activity_ring_caps_at_capacity_and_exposes_recent() {
        let pipeline = test_pipeline();
        for i in 0..(ACTIVITY_CAPACITY + 50) {
            pipeline.log_activity("scan", "tick", &format!("{}", i), None);
        }
        let recent = pipeline.recent_activity();
        assert_eq!(recent.len(), ACTIVITY_EXPOSED);
        // Chronological: the last entry is the newest.
        assert_eq!(recent.last().unwrap().detail, format!("{}", ACTIVITY_CAPACITY + 49));
        assert_eq!(recent.first().unwrap().detail, format!("{}", ACTIVITY_CAPACITY));
        assert_eq!(pipeline.activity.lock().len(), ACTIVITY_CAPACITY);
    }

    #[tokio::test]
    async fn second_start_conflicts_while_running() {
        let pipeline = test_pipeline();
        // Simulate an active worker.
        pipeline.running.store(true, Ordering::SeqCst);
        let err = pipeline.start_run(None).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        pipeline.running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn cancel_only_applies_to_active_runs() {
        let pipeline = test_pipeline();
        assert!(!pipeline.request_cancel());
        pipeline.running.store(true, Ordering::SeqCst);
        assert!(pipeline.request_cancel());
        assert!(pipeline.cancelled());
        pipeline.running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn live_map_swaps_whole_value() {
        let pipeline = test_pipeline();
        pipeline.swap_live(json!({"scan": {"status": "walking"}}));
        pipeline.swap_live(json!({"embed": {"embedded": 3, "total": 9}}));
        let live = pipeline.live_snapshot();
        let map = live.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("embed"));
    }
}
