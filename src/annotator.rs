//! Annotation stage: per-chunk structured LLM analysis with retry, backoff,
//! and version stamping.
//!
//! Annotations are never overwritten. The deterministic ID over (chunk,
//! model, prompt id, prompt version) makes a re-run with the same
//! configuration a no-op, while a changed model or prompt produces a new
//! current annotation and preserves the prior for audit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::ids;
use crate::llm::LlmClient;
use crate::model::{Annotation, AnnotationPayload, Chunk, PIPELINE_VERSION};
use crate::store::Store;

pub const PROMPT_ID: &str = "chunk-analysis-v1";
pub const PROMPT_VERSION: &str = "1";

pub const ANNOTATION_PROMPT: &str = "\
You are a careful document analyst. Analyze the user's text and respond with \
a single JSON object, no prose, matching exactly this shape:
{\"topics\": [\"...\"], \
\"sentiment\": {\"label\": \"positive|neutral|negative\", \"confidence\": 0.0}, \
\"entities\": [{\"name\": \"...\", \"type\": \"...\"}], \
\"claims\": [{\"claim\": \"...\", \"confidence\": 0.0}], \
\"summary\": \"...\", \
\"quality_flags\": []}
Use empty arrays when nothing applies. Confidence values are between 0 and 1.";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 5;

/// Pause between chunks so the inference server stays responsive for other
/// consumers.
const INTER_CHUNK_PAUSE_SECS: u64 = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotateOutcome {
    pub annotated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Annotator {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    /// Test hook: retry backoff and inter-chunk pause collapse to zero.
    fast_mode: bool,
}

impl Annotator {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>) -> Self {
        Self {
            store,
            llm,
            fast_mode: false,
        }
    }

    pub fn with_fast_mode(mut self) -> Self {
        self.fast_mode = true;
        self
    }

    /// Annotate every chunk not already covered by a current annotation from
    /// this model. The cancel flag is honored between chunks.
    pub async fn annotate_chunks(
        &self,
        model: &str,
        chunks: &[Chunk],
        cancel: &AtomicBool,
    ) -> AppResult<AnnotateOutcome> {
        let mut outcome = AnnotateOutcome::default();
        for chunk in chunks {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if self.store.has_current_annotation_by_model(&chunk.id, model)? {
                outcome.skipped += 1;
                continue;
            }

            match self.annotate_one(model, chunk).await {
                Some(payload) => {
                    let annotation = Annotation {
                        id: ids::annotation_id(&chunk.id, model, PROMPT_ID, PROMPT_VERSION),
                        chunk_id: chunk.id.clone(),
                        model_id: model.to_string(),
                        prompt_id: PROMPT_ID.to_string(),
                        prompt_version: PROMPT_VERSION.to_string(),
                        pipeline_version: PIPELINE_VERSION.to_string(),
                        payload,
                        is_current: true,
                        created_at: Utc::now(),
                    };
                    self.store.insert_annotation(&annotation)?;
                    outcome.annotated += 1;
                }
                None => outcome.failed += 1,
            }

            self.pause(INTER_CHUNK_PAUSE_SECS).await;
        }

        info!(
            annotated = outcome.annotated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "annotate pass complete"
        );
        Ok(outcome)
    }

    /// One chunk through the LLM with up to three attempts and linear
    /// backoff (5 s × attempt). Returns None when every attempt failed or
    /// the parsed object carries no signal.
    async fn annotate_one(&self, model: &str, chunk: &Chunk) -> Option<AnnotationPayload> {
        for attempt in 1..=MAX_ATTEMPTS {
            let reply = match self
                .llm
                .annotate_chunk(&chunk.text, ANNOTATION_PROMPT, model)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(chunk = %chunk.id, attempt, error = %e, "annotation request failed");
                    self.pause(BACKOFF_BASE_SECS * attempt as u64).await;
                    continue;
                }
            };

            match serde_json::from_str::<AnnotationPayload>(&reply) {
                Ok(payload) => {
                    if payload.summary.is_empty() && payload.topics.is_empty() {
                        debug!(chunk = %chunk.id, "annotation parsed but empty");
                        return None;
                    }
                    return Some(payload);
                }
                Err(e) => {
                    warn!(chunk = %chunk.id, attempt, error = %e, "annotation reply was not valid JSON");
                    self.pause(BACKOFF_BASE_SECS * attempt as u64).await;
                }
            }
        }
        None
    }

    async fn pause(&self, secs: u64) {
        if self.fast_mode || secs == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_ids_differ_by_model_and_prompt() {
        let by_model_a = ids::annotation_id("chunk", "model-a", PROMPT_ID, PROMPT_VERSION);
        let by_model_b = ids::annotation_id("chunk", "model-b", PROMPT_ID, PROMPT_VERSION);
        let by_prompt = ids::annotation_id("chunk", "model-a", PROMPT_ID, "2");
        assert_ne!(by_model_a, by_model_b);
        assert_ne!(by_model_a, by_prompt);
        assert_eq!(
            by_model_a,
            ids::annotation_id("chunk", "model-a", PROMPT_ID, PROMPT_VERSION)
        );
    }

    #[test]
    fn canned_payload_parses() {
        let canned = r#"{"topics":["t"],"sentiment":{"label":"neutral","confidence":0.5},"entities":[],"claims":[],"summary":"s","quality_flags":[]}"#;
        let payload: AnnotationPayload = serde_json::from_str(canned).unwrap();
        assert_eq!(payload.topics, vec!["t"]);
        assert_eq!(payload.summary, "s");
        assert!(!(payload.summary.is_empty() && payload.topics.is_empty()));
    }
}
