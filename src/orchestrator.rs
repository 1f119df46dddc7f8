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

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio_fetcher::AudioFetcher;
use crate::config::Config;
use crate::contracts::VoiceProfileStore;
use crate::diarizer::{DiarizeHint, Diarizer};
use crate::error::IngestError;
use crate::segment_builder::SegmentBuilder;
use crate::segment_store::SegmentStore;
use crate::source_lister::{ListOptions, SourceLister};
use crate::speaker_identifier::{ProfileCache, SpeakerIdentifier};
use crate::text_embedder::TextEmbedder;
use crate::transcript_acquirer::TranscriptAcquirer;
use crate::types::{compute_content_fingerprint, Source, SourceStatus};

/// How long a GPU-pool request can sit unserved before a starvation warning
/// is logged. Well above normal queueing for a single-permit GPU pool but
/// short enough to surface a genuinely stuck pipeline quickly.
const GPU_STARVATION_WARNING: Duration = Duration::from_secs(30);

/// The concrete stage objects the orchestrator drives, shared read-only
/// across every spawned per-source task.
pub struct PipelineStages {
    pub audio_fetcher: AudioFetcher,
    pub transcript_acquirer: TranscriptAcquirer,
    pub diarizer: Diarizer,
    pub speaker_identifier: SpeakerIdentifier,
    pub segment_builder: SegmentBuilder,
    pub text_embedder: TextEmbedder,
}

#[derive(Default)]
struct RunMetrics {
    sources_total: AtomicUsize,
    sources_completed: AtomicUsize,
    sources_failed: AtomicUsize,
    sources_skipped: AtomicUsize,
    failure_reasons: Mutex<HashMap<String, u32>>,
    gpu_queue_depth: AtomicUsize,
    gpu_queue_high_water_mark: AtomicUsize,
}

impl RunMetrics {
    async fn record_failure_reason(&self, reason: &str) {
        let mut guard = self.failure_reasons.lock().await;
        *guard.entry(reason.to_string()).or_insert(0) += 1;
    }

    fn enter_gpu_queue(&self) -> usize {
        let depth = self.gpu_queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.gpu_queue_high_water_mark.fetch_max(depth, Ordering::SeqCst);
        depth
    }

    fn leave_gpu_queue(&self) {
        self.gpu_queue_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sources_total: usize,
    pub sources_completed: usize,
    pub sources_failed: usize,
    pub sources_skipped: usize,
    pub top_failure_reasons: Vec<(String, u32)>,
    pub elapsed: Duration,
    pub gpu_queue_high_water_mark: usize,
}

/// Drives the whole pipeline over a channel's catalog: enumerate sources,
/// then fan each source out through fetch, transcript acquisition,
/// diarization, speaker identification, segmentation, embedding, and
/// persistence. Downloads and DB writes each get their own concurrency cap;
/// every model-inference call is serialized through a single-permit GPU
/// lock since there is exactly one accelerator to share.
pub struct Orchestrator {
    lister: SourceLister,
    stages: Arc<PipelineStages>,
    store: Arc<SegmentStore>,
    profile_store: Arc<dyn VoiceProfileStore>,
    profiles: Arc<ProfileCache>,
    config: Arc<Config>,
    io_semaphore: Arc<Semaphore>,
    gpu_lock: Arc<Mutex<()>>,
    db_semaphore: Arc<Semaphore>,
    metrics: Arc<RunMetrics>,
}

impl Orchestrator {
    pub fn new(
        lister: SourceLister,
        stages: PipelineStages,
        store: Arc<SegmentStore>,
        profile_store: Arc<dyn VoiceProfileStore>,
        profiles: Arc<ProfileCache>,
        config: Config,
    ) -> Self {
        let io_semaphore = Arc::new(Semaphore::new(config.pools.io_workers.max(1)));
        let db_semaphore = Arc::new(Semaphore::new(config.pools.db_workers.max(1)));
        Self {
            lister,
            stages: Arc::new(stages),
            store,
            profile_store,
            profiles,
            config: Arc::new(config),
            io_semaphore,
            gpu_lock: Arc::new(Mutex::new(())),
            db_semaphore,
            metrics: Arc::new(RunMetrics::default()),
        }
    }

    pub async fn run(&self, channel_ref: &str, cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        let started = Instant::now();

        let loaded_profiles = self.profile_store.load_all().await?;
        self.profiles.replace_all(loaded_profiles).await;

        let sources = self
            .lister
            .list(channel_ref, ListOptions { skip_shorts: self.config.skip_shorts, ..Default::default() })
            .await?;

        self.metrics.sources_total.store(sources.len(), Ordering::SeqCst);
        info!(count = sources.len(), channel_ref, "enumerated sources for ingestion run");

        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            if cancellation.is_cancelled() {
                break;
            }

            let stages = self.stages.clone();
            let store = self.store.clone();
            let profiles = self.profiles.clone();
            let config = self.config.clone();
            let io_semaphore = self.io_semaphore.clone();
            let gpu_lock = self.gpu_lock.clone();
            let db_semaphore = self.db_semaphore.clone();
            let metrics = self.metrics.clone();
            let cancel = cancellation.clone();
            let external_id = source.external_id.clone();

            handles.push(tokio::spawn(async move {
                if cancel.is_cancelled() {
                    return;
                }

                let result = process_source(
                    source,
                    &stages,
                    &store,
                    &profiles,
                    &config,
                    &io_semaphore,
                    &gpu_lock,
                    &db_semaphore,
                    &metrics,
                )
                .await;

                if let Err(e) = result {
                    warn!(source = %external_id, error = %e, "source processing ended in error");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let failure_reasons = self.metrics.failure_reasons.lock().await.clone();
        let mut top_failure_reasons: Vec<(String, u32)> = failure_reasons.into_iter().collect();
        top_failure_reasons.sort_by(|a, b| b.1.cmp(&a.1));

        let summary = RunSummary {
            sources_total: self.metrics.sources_total.load(Ordering::SeqCst),
            sources_completed: self.metrics.sources_completed.load(Ordering::SeqCst),
            sources_failed: self.metrics.sources_failed.load(Ordering::SeqCst),
            sources_skipped: self.metrics.sources_skipped.load(Ordering::SeqCst),
            top_failure_reasons,
            elapsed: started.elapsed(),
            gpu_queue_high_water_mark: self.metrics.gpu_queue_high_water_mark.load(Ordering::SeqCst),
        };

        info!(
            completed = summary.sources_completed,
            failed = summary.sources_failed,
            skipped = summary.sources_skipped,
            elapsed_sec = summary.elapsed.as_secs_f64(),
            "ingestion run finished"
        );

        Ok(summary)
    }
}

/// Runs fetch through persist for one source. Status transitions are
/// recorded on the source row as the pipeline advances so a crash mid-run
/// leaves an accurate `status` for the next reingest pass to pick up from.
#[allow(clippy::too_many_arguments)]
async fn process_source(
    mut source: Source,
    stages: &PipelineStages,
    store: &SegmentStore,
    profiles: &ProfileCache,
    config: &Config,
    io_semaphore: &Semaphore,
    gpu_lock: &Mutex<()>,
    db_semaphore: &Semaphore,
    metrics: &RunMetrics,
) -> Result<(), IngestError> {
    source.content_fingerprint = compute_content_fingerprint(
        &source.external_id,
        &[stages.text_embedder.model_key(), &stages.diarizer.voice_embedding_dimensions().to_string()],
    );

    if let Some((SourceStatus::Completed, existing_fingerprint)) =
        store.fetch_status_and_fingerprint(&source.external_id).await?
    {
        if existing_fingerprint == source.content_fingerprint {
            info!(source = %source.external_id, "content fingerprint unchanged since last completed run, skipping");
            metrics.sources_completed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
    }

    let source_id = store.upsert_source(&source).await?;
    source.id = Some(source_id);

    let dest_wav = config.temp_audio_path(&source.external_id);
    let artifact = {
        let _io_permit = io_semaphore.acquire().await.map_err(|_| IngestError::Cancelled)?;
        match stages.audio_fetcher.fetch(&source.external_id, &dest_wav).await {
            Ok(a) => a,
            Err(IngestError::SourceSkipped(reason)) => {
                metrics.sources_skipped.fetch_add(1, Ordering::SeqCst);
                store.update_source_status(source_id, SourceStatus::Skipped, Some(&reason)).await?;
                return Ok(());
            }
            Err(e) => return fail(store, metrics, source_id, e).await,
        }
    };
    store.update_source_status(source_id, SourceStatus::Fetched, None).await?;

    let primary_profile = profiles.get(&config.speaker.primary_voice_profile_name).await;

    let fast_path_similarity = match &primary_profile {
        Some(profile) => {
            let guard = acquire_gpu(gpu_lock, metrics, source_id).await;
            let similarity = stages
                .diarizer
                .sample_similarity_to_primary(&artifact.path, artifact.duration_sec, &profile.centroid)
                .await
                .unwrap_or(0.0);
            drop(guard);
            similarity
        }
        None => 0.0,
    };
    let assume_monologue =
        config.assume_monologue || fast_path_similarity >= config.speaker.fast_path_similarity;

    let transcript = {
        let io_result = {
            let _io_permit = io_semaphore.acquire().await.map_err(|_| IngestError::Cancelled)?;
            stages.transcript_acquirer.try_caption_tiers(&source.external_id).await
        };
        match io_result {
            Some(result) => Ok(result),
            None => {
                let guard = acquire_gpu(gpu_lock, metrics, source_id).await;
                let result = stages
                    .transcript_acquirer
                    .run_asr_fallback(&artifact.path, artifact.duration_sec)
                    .await;
                drop(guard);
                result
            }
        }
    };
    let (words, _provenance) = match transcript {
        Ok(v) => v,
        Err(e) => {
            cleanup_audio(config, &artifact.path).await;
            return fail(store, metrics, source_id, e).await;
        }
    };
    store.update_source_status(source_id, SourceStatus::Transcribed, None).await?;

    let guard = acquire_gpu(gpu_lock, metrics, source_id).await;
    let diarize_outcome = stages
        .diarizer
        .diarize(&artifact.path, artifact.duration_sec, DiarizeHint { assume_monologue, ..Default::default() })
        .await;

    let identified = match stages.speaker_identifier.identify(&artifact.path, &diarize_outcome.turns).await {
        Ok(v) => v,
        Err(e) => {
            warn!(source_id, error = %e, "speaker identification failed, proceeding with unknown labels");
            Vec::new()
        }
    };
    drop(guard);
    store.update_source_status(source_id, SourceStatus::Diarized, None).await?;

    let mut segments = stages.segment_builder.build(source_id, &words, &identified);

    if !segments.is_empty() {
        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let guard = acquire_gpu(gpu_lock, metrics, source_id).await;
        let embed_result = stages.text_embedder.embed(&texts).await;
        drop(guard);

        match embed_result {
            Ok(vectors) => {
                for (seg, vector) in segments.iter_mut().zip(vectors.into_iter()) {
                    seg.text_embedding = Some(vector);
                    seg.text_embedding_model_key = stages.text_embedder.model_key().to_string();
                }
            }
            Err(e) => {
                cleanup_audio(config, &artifact.path).await;
                return fail(store, metrics, source_id, e).await;
            }
        }
    }
    store.update_source_status(source_id, SourceStatus::Embedded, None).await?;

    let _db_permit = db_semaphore.acquire().await.map_err(|_| IngestError::Cancelled)?;
    if let Err(e) = store.insert_segments(&segments, config.pools.insert_batch_size).await {
        cleanup_audio(config, &artifact.path).await;
        return fail(store, metrics, source_id, e).await;
    }

    cleanup_audio(config, &artifact.path).await;
    store.update_source_status(source_id, SourceStatus::Completed, None).await?;
    metrics.sources_completed.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

async fn acquire_gpu<'a>(
    gpu_lock: &'a Mutex<()>,
    metrics: &RunMetrics,
    source_id: i64,
) -> tokio::sync::MutexGuard<'a, ()> {
    let depth = metrics.enter_gpu_queue();
    let waited_since = Instant::now();
    let guard = gpu_lock.lock().await;
    if depth > 1 && waited_since.elapsed() > GPU_STARVATION_WARNING {
        warn!(
            source_id,
            wait_sec = waited_since.elapsed().as_secs_f64(),
            "GPU pool starved this source, consider raising io concurrency to smooth arrivals"
        );
    }
    metrics.leave_gpu_queue();
    guard
}

async fn cleanup_audio(config: &Config, path: &std::path::Path) {
    if config.cleanup_audio_after_processing {
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn fail(store: &SegmentStore, metrics: &RunMetrics, source_id: i64, e: IngestError) -> Result<(), IngestError> {
    if let Some(reason) = e.failure_reason() {
        metrics.sources_failed.fetch_add(1, Ordering::SeqCst);
        metrics.record_failure_reason(&reason).await;
        store.update_source_status(source_id, SourceStatus::Failed, Some(&reason)).await?;
    }
    Err(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gpu_queue_depth_tracks_high_water_mark() {
        let metrics = RunMetrics::default();
        metrics.enter_gpu_queue();
        let depth = metrics.enter_gpu_queue();
        assert_eq!(depth, 2);
        metrics.leave_gpu_queue();
        metrics.leave_gpu_queue();
        assert_eq!(metrics.gpu_queue_high_water_mark.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.gpu_queue_depth.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_reasons_accumulate_counts() {
        let metrics = RunMetrics::default();
        metrics.record_failure_reason("fetch").await;
        metrics.record_failure_reason("fetch").await;
        metrics.record_failure_reason("persist").await;
        let guard = metrics.failure_reasons.lock().await;
        assert_eq!(guard.get("fetch"), Some(&2));
        assert_eq!(guard.get("persist"), Some(&1));
    }

    #[test]
    fn soft_errors_carry_no_failure_reason() {
        let e = IngestError::DiarizationDegraded("stub".to_string());
        assert!(e.failure_reason().is_none());
    }
}
