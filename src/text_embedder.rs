/*
 * Chaffee Ingest - Podcast Catalog Ingestion Pipeline
 * Copyright (c) 2024 Meeting Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::sync::Arc;

use tracing::warn;

use crate::contracts::TextEmbeddingModel;
use crate::error::IngestError;

/// Produces a dense vector per segment text. Owns the
/// retry-halve-then-per-item-loop policy around a `TextEmbeddingModel`
/// contract, which only ever embeds exactly the batch it's given.
pub struct TextEmbedder {
    model: Arc<dyn TextEmbeddingModel>,
    batch_size: usize,
}

impl TextEmbedder {
    pub fn new(model: Arc<dyn TextEmbeddingModel>, batch_size: usize) -> Self {
        Self { model, batch_size }
    }

    pub fn model_key(&self) -> &str {
        self.model.model_key()
    }

    pub fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    /// Embeds a full list of texts, chunked into configured batches,
    /// preserving input order across the concatenated output.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size.max(1)) {
            let embedded = self.embed_batch_with_retry(chunk, self.batch_size.max(1)).await?;
            out.extend(embedded);
        }
        Ok(out)
    }

    /// Retries once with halved batch size on failure; if that still fails,
    /// falls back to a per-item loop and logs a performance warning.
    /// `EmbeddingFailure` is only raised once every fallback path for this
    /// batch is exhausted.
    async fn embed_batch_with_retry(
        &self,
        batch: &[String],
        original_batch_size: usize,
    ) -> Result<Vec<Vec<f32>>, IngestError> {
        match self.model.embed_batch(batch).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(error = %e, batch_size = batch.len(), "text embedding batch failed, retrying halved");
            }
        }

        if batch.len() > 1 {
            let half = (batch.len() / 2).max(1);
            let mut halved_out = Vec::with_capacity(batch.len());
            let mut ok = true;
            for sub in batch.chunks(half) {
                match self.model.embed_batch(sub).await {
                    Ok(v) => halved_out.extend(v),
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                return Ok(halved_out);
            }
        }

        warn!(batch_size = batch.len(), "halved retry failed, falling back to per-item embedding");
        let mut per_item = Vec::with_capacity(batch.len());
        for text in batch {
            match self.model.embed_batch(std::slice::from_ref(text)).await {
                Ok(mut v) => per_item.push(v.remove(0)),
                Err(e) => {
                    return Err(IngestError::EmbeddingFailure(format!(
                        "batch of {} failed after retry and per-item fallback: {e} (original batch size {original_batch_size})",
                        batch.len()
                    )));
                }
            }
        }
        Ok(per_item)
    }
}
