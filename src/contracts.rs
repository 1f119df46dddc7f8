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

//! Narrow capability contracts for every external collaborator.
//! Each trait covers exactly one concern; selection between implementations
//! is by configuration, constructed once at startup. No shared base trait,
//! no default no-op methods — a backend either implements its one contract
//! or it doesn't exist in the pipeline.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::types::VoiceProfile;

/// Normalized descriptor yielded by a source discovery backend.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub external_id: String,
    pub title: String,
    pub publish_instant: chrono::DateTime<chrono::Utc>,
    pub duration_sec: f64,
    pub is_live_or_upcoming: bool,
    pub is_members_only: bool,
    pub has_owner_captions: bool,
}

/// One of the two listing modes (authenticated API, scraping fallback).
#[async_trait]
pub trait SourceDiscoveryBackend: Send + Sync {
    async fn list(
        &self,
        channel_ref: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<SourceDescriptor>>;
}

/// Fetched bytes plus the advertised (unverified) duration of a source's
/// best audio track.
pub struct FetchedAudio {
    pub bytes: Vec<u8>,
    pub advertised_duration_sec: f64,
    pub container_hint: String,
}

#[async_trait]
pub trait AudioSourceBackend: Send + Sync {
    async fn fetch_best_audio(&self, external_id: &str) -> Result<FetchedAudio>;
}

/// A single transcribed word plus its timing, as returned by the ASR model
/// before provenance tagging.
#[derive(Debug, Clone)]
pub struct AsrWord {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct AsrChunkResult {
    pub words: Vec<AsrWord>,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
}

#[async_trait]
pub trait AsrModel: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        beam_size: usize,
        temperatures: &[f32],
    ) -> Result<AsrChunkResult>;
}

/// Raw, non-overlapping turns from the diarization backend, prior to the
/// fast-path/degraded-fallback wrapping the Diarizer component applies.
#[derive(Debug, Clone, Copy)]
pub struct RawTurn {
    pub start_sec: f64,
    pub end_sec: f64,
    pub cluster_id: u32,
}

#[async_trait]
pub trait DiarizationModel: Send + Sync {
    async fn diarize(
        &self,
        audio_path: &Path,
        min_speakers: Option<usize>,
        max_speakers: Option<usize>,
    ) -> Result<Vec<RawTurn>>;
}

#[async_trait]
pub trait VoiceEmbeddingModel: Send + Sync {
    /// Returns one vector per requested window, or `None` for windows too
    /// short to embed. Output order matches input order.
    async fn embed_windows(
        &self,
        audio_path: &Path,
        windows: &[(f64, f64)],
    ) -> Result<Vec<Option<Vec<f32>>>>;

    fn dimensions(&self) -> usize;
}

#[async_trait]
pub trait TextEmbeddingModel: Send + Sync {
    /// Embeds one batch, preserving input order. Callers own the
    /// retry/halve-then-per-item-loop policy; this contract only
    /// ever embeds exactly the batch it is given or fails outright.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_key(&self) -> &str;
    fn dimensions(&self) -> usize;
}

/// Read-only mapping from name to voice profile, consulted once per
/// orchestrator run (profiles do not mutate during ingestion).
#[async_trait]
pub trait VoiceProfileStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<VoiceProfile>>;
}
