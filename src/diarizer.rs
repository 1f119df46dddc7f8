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

use tracing::warn;

use crate::contracts::{DiarizationModel, VoiceEmbeddingModel};
use crate::types::SpeakerTurn;
use crate::vecmath::cosine_similarity;

pub const DEFAULT_CLUSTERING_THRESHOLD: f32 = 0.3;

/// Produces a sorted, non-overlapping sequence of speaker turns over the
/// audio timeline. Wraps a raw `DiarizationModel` with the fast-path
/// bypass and degraded-failure stub the external contract itself knows
/// nothing about.
pub struct Diarizer {
    model: Arc<dyn DiarizationModel>,
    voice_embedder: Arc<dyn VoiceEmbeddingModel>,
    clustering_threshold: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct DiarizeHint {
    pub min_speakers: Option<usize>,
    pub max_speakers: Option<usize>,
    pub assume_monologue: bool,
}

impl Default for DiarizeHint {
    fn default() -> Self {
        Self { min_speakers: None, max_speakers: None, assume_monologue: false }
    }
}

pub struct DiarizeOutcome {
    pub turns: Vec<SpeakerTurn>,
    pub degraded: bool,
}

impl Diarizer {
    pub fn new(model: Arc<dyn DiarizationModel>, voice_embedder: Arc<dyn VoiceEmbeddingModel>) -> Self {
        Self { model, voice_embedder, clustering_threshold: DEFAULT_CLUSTERING_THRESHOLD }
    }

    /// Samples up to 60s of audio and checks the resulting voice embedding's
    /// cosine similarity against the primary profile's centroid. Used by the
    /// orchestrator to decide whether to call `diarize` with
    /// `hint.assume_monologue = true`, applied eagerly before any diarization call.
    pub async fn sample_similarity_to_primary(
        &self,
        audio_path: &Path,
        duration_sec: f64,
        primary_centroid: &[f32],
    ) -> anyhow::Result<f32> {
        let sample_end = duration_sec.min(60.0);
        let windows = [(0.0, sample_end)];
        let embeddings = self.voice_embedder.embed_windows(audio_path, &windows).await?;
        match embeddings.into_iter().next().flatten() {
            Some(embedding) => Ok(cosine_similarity(&embedding, primary_centroid)),
            None => Ok(0.0),
        }
    }

    pub async fn diarize(
        &self,
        audio_path: &Path,
        duration_sec: f64,
        hint: DiarizeHint,
    ) -> DiarizeOutcome {
        if hint.assume_monologue {
            return DiarizeOutcome {
                turns: vec![single_turn(duration_sec)],
                degraded: false,
            };
        }

        match self
            .model
            .diarize(audio_path, hint.min_speakers, hint.max_speakers)
            .await
        {
            Ok(raw_turns) => {
                let turns = normalize_turns(raw_turns, duration_sec);
                DiarizeOutcome { turns, degraded: false }
            }
            Err(e) => {
                warn!(error = %e, "diarization failed, using single-turn stub");
                DiarizeOutcome { turns: vec![single_turn(duration_sec)], degraded: true }
            }
        }
    }

    pub fn clustering_threshold(&self) -> f32 {
        self.clustering_threshold
    }

    pub fn voice_embedding_dimensions(&self) -> usize {
        self.voice_embedder.dimensions()
    }
}

fn single_turn(duration_sec: f64) -> SpeakerTurn {
    SpeakerTurn { start_sec: 0.0, end_sec: duration_sec, cluster_id: 0 }
}

/// Sorts raw turns and clamps the final turn's end to the measured audio
/// duration; the diarization model is required to already be
/// non-overlapping, this only enforces ordering defensively.
fn normalize_turns(raw: Vec<crate::contracts::RawTurn>, duration_sec: f64) -> Vec<SpeakerTurn> {
    let mut turns: Vec<SpeakerTurn> = raw
        .into_iter()
        .map(|t| SpeakerTurn { start_sec: t.start_sec, end_sec: t.end_sec, cluster_id: t.cluster_id })
        .collect();
    turns.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());
    if let Some(last) = turns.last_mut() {
        if last.end_sec > duration_sec {
            last.end_sec = duration_sec;
        }
    }
    turns
}
