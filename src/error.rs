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

use thiserror::Error;

/// Typed per-source error taxonomy. The orchestrator classifies every
/// tier failure into one of these at the per-source boundary; only
/// `Cancelled` and unhandled programmer errors are allowed to propagate
/// further up than that boundary.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source skipped: {0}")]
    SourceSkipped(String),

    #[error("fetch failed after retries: {0}")]
    FetchFailure(String),

    #[error("source discovery failed: {0}")]
    SourceDiscoveryError(String),

    #[error("no transcript tier succeeded: {0}")]
    TranscriptUnavailable(String),

    #[error("diarization degraded, using single-turn stub: {0}")]
    DiarizationDegraded(String),

    #[error("speaker identification inconclusive: {0}")]
    IdentificationInconclusive(String),

    #[error("text embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("persist failed: {0}")]
    PersistFailure(String),

    #[error("GPU out of memory at batch size {batch_size}: {message}")]
    GpuOom { batch_size: usize, message: String },

    #[error("source embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    /// Whether this error kind is "soft": the source still proceeds to
    /// completion rather than being marked failed.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            IngestError::DiarizationDegraded(_) | IngestError::IdentificationInconclusive(_)
        )
    }

    /// The human-readable failure reason recorded on the Source, or `None`
    /// for soft errors that do not fail the source.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            IngestError::SourceSkipped(_) => None,
            IngestError::DiarizationDegraded(_) | IngestError::IdentificationInconclusive(_) => None,
            IngestError::FetchFailure(_) => Some("fetch".to_string()),
            IngestError::SourceDiscoveryError(_) => Some("source_discovery".to_string()),
            IngestError::TranscriptUnavailable(_) => Some("transcript_unavailable".to_string()),
            IngestError::EmbeddingFailure(_) => Some("embedding".to_string()),
            IngestError::PersistFailure(_) => Some("persist".to_string()),
            IngestError::GpuOom { .. } => Some("gpu_oom".to_string()),
            IngestError::EmbeddingDimensionMismatch { .. } => {
                Some("embedding_dimension_mismatch".to_string())
            }
            IngestError::Cancelled => Some("cancelled".to_string()),
        }
    }
}
