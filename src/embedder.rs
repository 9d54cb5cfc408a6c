//! Embedding stage: batches unembedded chunks through the inference server
//! and lands the vectors in the store (which persists the blob and feeds the
//! cache in one pass).
//!
//! A batch that fails the embed request is logged and skipped; its chunks
//! stay unembedded and are retried on the next run. With the server offline
//! the stage degrades to zero embedded, never to a run failure.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::AppResult;
use crate::llm::LlmClient;
use crate::model::{Chunk, VectorRecord, PIPELINE_VERSION};
use crate::store::Store;

pub struct Embedder {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>, batch_size: usize) -> Self {
        Self {
            store,
            llm,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed the given chunks in batches. Returns the count successfully
    /// embedded; the progress callback sees (processed, total) after every
    /// batch.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        mut on_progress: impl FnMut(usize, usize),
    ) -> AppResult<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        // Model id and vector dimension are resolved lazily on first use.
        let model = match self.llm.embedding_model().await {
            Ok(model) => model,
            Err(e) => {
                warn!(error = %e, "no embedding model available; skipping embed stage");
                return Ok(0);
            }
        };

        let total = chunks.len();
        let mut embedded = 0usize;
        let mut processed = 0usize;
        let mut dimension_fixed = self.store.vector_dimension().is_some();
        let mut path_cache: HashMap<String, String> = HashMap::new();

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = match self.llm.embed(&texts, &model).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "embed batch failed; will retry next run");
                    processed += batch.len();
                    on_progress(processed, total);
                    continue;
                }
            };

            if !dimension_fixed {
                if let Some(first) = vectors.first() {
                    self.store.set_vector_dimension(first.len());
                    dimension_fixed = true;
                }
            }

            let mut records = Vec::with_capacity(batch.len());
            for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
                let asset_path = match path_cache.get(&chunk.asset_id) {
                    Some(path) => path.clone(),
                    None => {
                        let path = self
                            .store
                            .get_asset(&chunk.asset_id)?
                            .map(|a| a.path)
                            .unwrap_or_default();
                        path_cache.insert(chunk.asset_id.clone(), path.clone());
                        path
                    }
                };
                records.push(VectorRecord {
                    chunk_id: chunk.id.clone(),
                    vector: vector.into_iter().map(|x| x as f32).collect(),
                    text: chunk.text.clone(),
                    asset_id: chunk.asset_id.clone(),
                    asset_path,
                    anchor_json: chunk.anchor.to_json(),
                    pipeline_version: PIPELINE_VERSION.to_string(),
                });
            }

            self.store.add_vectors(&records)?;
            for chunk in batch {
                self.store.set_chunk_embedding_ref(&chunk.id, &chunk.id)?;
            }
            embedded += batch.len();
            processed += batch.len();
            on_progress(processed, total);
        }

        info!(embedded, total, model = %model, "embed stage complete");
        Ok(embedded)
    }
}
