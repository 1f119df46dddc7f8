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

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::contracts::{AsrModel, AsrWord};
use crate::error::IngestError;
use crate::types::{Provenance, WordTiming};

pub const DEFAULT_BEAM_SIZE: usize = 5;
pub const TEMPERATURE_FALLBACK: [f32; 4] = [0.0, 0.2, 0.4, 0.6];
const LOW_CONFIDENCE_LOGPROB: f32 = -0.35;
const LOW_CONFIDENCE_COMPRESSION_RATIO: f32 = 2.4;
const LONG_FILE_CHUNK_SEC: f64 = 30.0 * 60.0;
const CHUNK_WINDOW_SEC: f64 = 30.0;
const CHUNK_OVERLAP_SEC: f64 = 1.0;

/// An out-of-process or third-party source of ready-made captions, tried
/// before falling back to ASR. Each tier is "try, and report `None`
/// rather than erroring if there's simply nothing there."
#[async_trait::async_trait]
pub trait CaptionTier: Send + Sync {
    async fn try_fetch(&self, source_external_id: &str) -> anyhow::Result<Option<Vec<WordTiming>>>;
    fn provenance(&self) -> Provenance;
}

/// Obtains a word-timed transcript via tiered fallback: owner
/// captions, platform captions, third-party subtitles, then ASR. First tier
/// to produce output wins.
pub struct TranscriptAcquirer {
    caption_tiers: Vec<Arc<dyn CaptionTier>>,
    asr: Arc<dyn AsrModel>,
}

impl TranscriptAcquirer {
    pub fn new(caption_tiers: Vec<Arc<dyn CaptionTier>>, asr: Arc<dyn AsrModel>) -> Self {
        Self { caption_tiers, asr }
    }

    pub async fn acquire(
        &self,
        source_external_id: &str,
        audio_path: &Path,
        duration_sec: f64,
    ) -> Result<(Vec<WordTiming>, Provenance), IngestError> {
        if let Some(result) = self.try_caption_tiers(source_external_id).await {
            return Ok(result);
        }
        self.run_asr_fallback(audio_path, duration_sec).await
    }

    /// Tries every I/O-bound caption tier in order; `None` means none of
    /// them had anything and the ASR fallback is needed. Never touches the
    /// GPU, so callers can run this outside of any GPU-serialization guard.
    pub async fn try_caption_tiers(&self, source_external_id: &str) -> Option<(Vec<WordTiming>, Provenance)> {
        for tier in &self.caption_tiers {
            match tier.try_fetch(source_external_id).await {
                Ok(Some(words)) => {
                    debug!(provenance = ?tier.provenance(), "caption tier produced a transcript");
                    return Some((words, tier.provenance()));
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "caption tier errored, trying next tier");
                    continue;
                }
            }
        }
        None
    }

    /// Runs the GPU-resident ASR fallback only; callers should hold a GPU
    /// guard around this call and nothing else.
    pub async fn run_asr_fallback(
        &self,
        audio_path: &Path,
        duration_sec: f64,
    ) -> Result<(Vec<WordTiming>, Provenance), IngestError> {
        match self.transcribe_with_asr(audio_path, duration_sec).await {
            Ok(words) => Ok((words, Provenance::Asr)),
            Err(e) => Err(IngestError::TranscriptUnavailable(format!(
                "all caption tiers and ASR failed: {e}"
            ))),
        }
    }

    async fn transcribe_with_asr(
        &self,
        audio_path: &Path,
        duration_sec: f64,
    ) -> anyhow::Result<Vec<WordTiming>> {
        let windows = chunk_windows(duration_sec);
        let mut words = Vec::new();

        for (chunk_start, _chunk_end) in windows {
            let result = self.transcribe_chunk_with_temperature_fallback(audio_path).await?;
            for w in result.words {
                words.push(WordTiming {
                    start_sec: w.start_sec + chunk_start,
                    end_sec: w.end_sec + chunk_start,
                    text: w.text,
                    provenance: Provenance::Asr,
                    confidence: logprob_to_confidence(result.avg_logprob),
                });
            }
        }

        words.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());
        Ok(words)
    }

    /// Runs the ASR model once per configured temperature, stopping at the
    /// first result that doesn't look low-confidence.
    async fn transcribe_chunk_with_temperature_fallback(
        &self,
        audio_path: &Path,
    ) -> anyhow::Result<crate::contracts::AsrChunkResult> {
        let mut last = None;
        for &temp in TEMPERATURE_FALLBACK.iter() {
            let result = self
                .asr
                .transcribe(audio_path, DEFAULT_BEAM_SIZE, &[temp])
                .await?;
            let low_confidence = result.avg_logprob < LOW_CONFIDENCE_LOGPROB
                || result.compression_ratio > LOW_CONFIDENCE_COMPRESSION_RATIO;
            if !low_confidence {
                return Ok(result);
            }
            last = Some(result);
        }
        Ok(last.expect("TEMPERATURE_FALLBACK is non-empty"))
    }
}

fn logprob_to_confidence(avg_logprob: f32) -> f32 {
    // avg_logprob is typically in (-inf, 0]; map the low-confidence cutoff
    // (-0.35) to 0.5 and clamp at the extremes.
    (1.0 + avg_logprob / 0.7).clamp(0.0, 1.0)
}

/// For files at or above 30 minutes, chunks into overlapping 30s windows
/// with 1s overlap to bound peak memory. Shorter files are a single
/// window covering the whole duration.
fn chunk_windows(duration_sec: f64) -> Vec<(f64, f64)> {
    if duration_sec < LONG_FILE_CHUNK_SEC {
        return vec![(0.0, duration_sec)];
    }

    let mut windows = Vec::new();
    let mut start = 0.0;
    while start < duration_sec {
        let end = (start + CHUNK_WINDOW_SEC).min(duration_sec);
        windows.push((start, end));
        if end >= duration_sec {
            break;
        }
        start += CHUNK_WINDOW_SEC - CHUNK_OVERLAP_SEC;
    }
    windows
}
