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

//! Standalone harness for exercising the diarizer's fast-path and clustering
//! logic against a real WAV file without a full pipeline run. Mirrors the
//! teacher's `process_audio` debugging entrypoint: point it at a file on
//! disk and read timing/shape output on stderr.
//!
//! No diarization or voice-embedding backend ships in this crate (those are
//! external collaborators selected at deployment time), so this harness
//! stands up small deterministic in-memory stubs purely to drive the
//! `Diarizer` wrapper's own logic (fast-path bypass, turn normalization,
//! degraded fallback) under realistic timings. It does not benchmark any
//! real model.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;

use chaffee_ingest::contracts::{DiarizationModel, RawTurn, VoiceEmbeddingModel};
use chaffee_ingest::diarizer::{DiarizeHint, Diarizer};

const STUB_VOICE_EMBEDDING_DIMENSIONS: usize = 32;

/// Deterministic, content-free embedder: derives a unit vector from a
/// window's position alone so repeated runs are comparable.
struct StubVoiceEmbedder;

#[async_trait]
impl VoiceEmbeddingModel for StubVoiceEmbedder {
    async fn embed_windows(
        &self,
        _audio_path: &Path,
        windows: &[(f64, f64)],
    ) -> Result<Vec<Option<Vec<f32>>>> {
        Ok(windows
            .iter()
            .map(|(start, end)| {
                if (end - start) < 1.0 {
                    return None;
                }
                let mut v = vec![0.0f32; STUB_VOICE_EMBEDDING_DIMENSIONS];
                let seed = (*start * 1000.0) as u64;
                for (i, slot) in v.iter_mut().enumerate() {
                    *slot = (((seed + i as u64) % 997) as f32 / 997.0) - 0.5;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                for slot in v.iter_mut() {
                    *slot /= norm;
                }
                Some(v)
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        STUB_VOICE_EMBEDDING_DIMENSIONS
    }
}

/// Splits the file into fixed 45s turns alternating between two cluster
/// ids, just enough shape for the normalization/sorting path to exercise.
struct StubDiarizer;

#[async_trait]
impl DiarizationModel for StubDiarizer {
    async fn diarize(
        &self,
        audio_path: &Path,
        _min_speakers: Option<usize>,
        _max_speakers: Option<usize>,
    ) -> Result<Vec<RawTurn>> {
        let (duration_sec, ..) = measure_wav(audio_path)?;
        let turn_len = 45.0;
        let mut turns = Vec::new();
        let mut start = 0.0;
        let mut cluster_id = 0;
        while start < duration_sec {
            let end = (start + turn_len).min(duration_sec);
            turns.push(RawTurn { start_sec: start, end_sec: end, cluster_id });
            start = end;
            cluster_id = 1 - cluster_id;
        }
        Ok(turns)
    }
}

fn measure_wav(path: &Path) -> Result<(f64, u32, u16)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open wav file at {}", path.display()))?;
    let spec = reader.spec();
    let duration_sec = reader.duration() as f64 / spec.sample_rate as f64;
    Ok((duration_sec, spec.sample_rate, spec.channels))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let audio_path: PathBuf = match env::args().nth(1) {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("usage: worker-bench <path/to/audio.wav>");
            std::process::exit(2);
        }
    };

    if !audio_path.exists() {
        eprintln!("no such file: {}", audio_path.display());
        std::process::exit(1);
    }

    let (duration_sec, sample_rate, channels) = measure_wav(&audio_path)?;
    println!(
        "file: {} ({:.1}s, {}Hz, {}ch)",
        audio_path.display(),
        duration_sec,
        sample_rate,
        channels
    );

    let diarizer = Diarizer::new(Arc::new(StubDiarizer), Arc::new(StubVoiceEmbedder));

    let primary_centroid = vec![0.1f32; STUB_VOICE_EMBEDDING_DIMENSIONS];
    let started = Instant::now();
    let similarity = diarizer
        .sample_similarity_to_primary(&audio_path, duration_sec, &primary_centroid)
        .await?;
    println!(
        "sample_similarity_to_primary: {:.4} ({:?})",
        similarity,
        started.elapsed()
    );

    let hint = DiarizeHint::default();
    let started = Instant::now();
    let outcome = diarizer.diarize(&audio_path, duration_sec, hint).await;
    println!(
        "diarize: {} turns, degraded={} ({:?})",
        outcome.turns.len(),
        outcome.degraded,
        started.elapsed()
    );
    for turn in &outcome.turns {
        println!(
            "  [{:>3}] {:7.2}s - {:7.2}s",
            turn.cluster_id, turn.start_sec, turn.end_sec
        );
    }

    let started = Instant::now();
    let monologue_outcome = diarizer
        .diarize(&audio_path, duration_sec, DiarizeHint { assume_monologue: true, ..hint })
        .await;
    println!(
        "diarize (assume_monologue): {} turn(s) ({:?})",
        monologue_outcome.turns.len(),
        started.elapsed()
    );

    Ok(())
}
