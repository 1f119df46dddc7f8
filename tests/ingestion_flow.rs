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

//! Exercises the pipeline stages from transcript acquisition through
//! persistence end to end, against fake in-process backends and a real
//! (in-memory) segment store. Audio download/transcode is out of scope
//! here since it shells out to `ffmpeg`; `audio_fetcher`'s own unit tests
//! cover its retry and duration-cap behavior in isolation.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chaffee_ingest::config::{Config, PoolConfig, SegmentConfig, SpeakerIdConfig};
use chaffee_ingest::contracts::{
    AsrChunkResult, AsrModel, AsrWord, AudioSourceBackend, FetchedAudio, SourceDescriptor,
    SourceDiscoveryBackend, TextEmbeddingModel, VoiceEmbeddingModel, VoiceProfileStore,
};
use chaffee_ingest::diarizer::{DiarizeHint, Diarizer};
use chaffee_ingest::orchestrator::{Orchestrator, PipelineStages};
use chaffee_ingest::segment_builder::SegmentBuilder;
use chaffee_ingest::segment_store::SegmentStore;
use chaffee_ingest::source_lister::SourceLister;
use chaffee_ingest::speaker_identifier::{ProfileCache, SpeakerIdentifier};
use chaffee_ingest::text_embedder::TextEmbedder;
use chaffee_ingest::transcript_acquirer::TranscriptAcquirer;
use chaffee_ingest::types::{Source, SourceStatus, VoiceProfile};

const VOICE_DIMENSIONS: usize = 4;
const TEXT_DIMENSIONS: usize = 4;

struct ScriptedAsr {
    words: Vec<AsrWord>,
}

#[async_trait]
impl AsrModel for ScriptedAsr {
    async fn transcribe(
        &self,
        _audio_path: &Path,
        _beam_size: usize,
        _temperatures: &[f32],
    ) -> anyhow::Result<AsrChunkResult> {
        Ok(AsrChunkResult { words: self.words.clone(), avg_logprob: -0.05, compression_ratio: 1.0 })
    }
}

/// Gives every window a voice embedding that is a unit vector along one of
/// two axes, chosen by whether the window falls in the first or second half
/// of a fixed split point, so clustering has two clearly separable voices.
struct TwoVoiceEmbedder {
    split_at_sec: f64,
}

#[async_trait]
impl VoiceEmbeddingModel for TwoVoiceEmbedder {
    async fn embed_windows(
        &self,
        _audio_path: &Path,
        windows: &[(f64, f64)],
    ) -> anyhow::Result<Vec<Option<Vec<f32>>>> {
        Ok(windows
            .iter()
            .map(|(start, _end)| {
                let mut v = vec![0.0f32; VOICE_DIMENSIONS];
                if *start < self.split_at_sec {
                    v[0] = 1.0;
                } else {
                    v[1] = 1.0;
                }
                Some(v)
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        VOICE_DIMENSIONS
    }
}

struct StubTextEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl TextEmbeddingModel for StubTextEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0, 0.0, 1.0]).collect())
    }

    fn model_key(&self) -> &str {
        "stub-text-embedder-v1"
    }

    fn dimensions(&self) -> usize {
        TEXT_DIMENSIONS
    }
}

struct MonologueDiarizer;

#[async_trait]
impl chaffee_ingest::contracts::DiarizationModel for MonologueDiarizer {
    async fn diarize(
        &self,
        _audio_path: &Path,
        _min_speakers: Option<usize>,
        _max_speakers: Option<usize>,
    ) -> anyhow::Result<Vec<chaffee_ingest::contracts::RawTurn>> {
        Ok(vec![chaffee_ingest::contracts::RawTurn { start_sec: 0.0, end_sec: 20.0, cluster_id: 0 }])
    }
}

struct TwoSpeakerDiarizer;

#[async_trait]
impl chaffee_ingest::contracts::DiarizationModel for TwoSpeakerDiarizer {
    async fn diarize(
        &self,
        _audio_path: &Path,
        _min_speakers: Option<usize>,
        _max_speakers: Option<usize>,
    ) -> anyhow::Result<Vec<chaffee_ingest::contracts::RawTurn>> {
        Ok(vec![
            chaffee_ingest::contracts::RawTurn { start_sec: 0.0, end_sec: 10.0, cluster_id: 0 },
            chaffee_ingest::contracts::RawTurn { start_sec: 10.0, end_sec: 20.0, cluster_id: 1 },
        ])
    }
}

async fn in_memory_store() -> SegmentStore {
    SegmentStore::connect("sqlite::memory:", 4, TEXT_DIMENSIONS, VOICE_DIMENSIONS)
        .await
        .expect("in-memory store should always connect")
}

fn primary_profile() -> VoiceProfile {
    VoiceProfile {
        name: "Chaffee".to_string(),
        centroid: vec![1.0, 0.0, 0.0, 0.0],
        samples: vec![vec![1.0, 0.0, 0.0, 0.0]],
        threshold_override: None,
    }
}

#[tokio::test]
async fn monologue_fast_path_labels_every_segment_as_the_primary_speaker() {
    let store = in_memory_store().await;
    let source = Source::new("ep-1", "Solo Episode", 20.0);
    let source_id = store.upsert_source(&source).await.unwrap();

    let words: Vec<AsrWord> = (0..30)
        .map(|i| AsrWord {
            start_sec: i as f64 * 0.6,
            end_sec: i as f64 * 0.6 + 0.5,
            text: format!("word{i}"),
        })
        .collect();
    let acquirer = TranscriptAcquirer::new(vec![], Arc::new(ScriptedAsr { words }));
    let (transcript, _provenance) = acquirer.acquire("ep-1", Path::new("/tmp/ep-1.wav"), 20.0).await.unwrap();

    let diarizer = Diarizer::new(Arc::new(MonologueDiarizer), Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }));
    let outcome = diarizer.diarize(Path::new("/tmp/ep-1.wav"), 20.0, DiarizeHint { assume_monologue: true, ..Default::default() }).await;
    assert!(!outcome.degraded);
    assert_eq!(outcome.turns.len(), 1);

    let profiles = Arc::new(ProfileCache::new());
    profiles.replace_all(vec![primary_profile()]).await;
    let identifier = SpeakerIdentifier::new(Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }), profiles, SpeakerIdConfig::default());
    let identified = identifier.identify(Path::new("/tmp/ep-1.wav"), &outcome.turns).await.unwrap();

    let builder = SegmentBuilder::new(SegmentConfig { min_chars: 1, max_chars: 1000, hard_cap_chars: 2000, ..SegmentConfig::default() });
    let mut segments = builder.build(source_id, &transcript, &identified);
    assert!(!segments.is_empty());
    assert!(segments.iter().all(|s| s.speaker_label == "Chaffee"));

    let embedder = TextEmbedder::new(Arc::new(StubTextEmbedder { calls: AtomicUsize::new(0) }), 64);
    let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
    let vectors = embedder.embed(&texts).await.unwrap();
    for (seg, vector) in segments.iter_mut().zip(vectors.into_iter()) {
        seg.text_embedding = Some(vector);
        seg.text_embedding_model_key = embedder.model_key().to_string();
    }

    let inserted = store.insert_segments(&segments, 512).await.unwrap();
    assert_eq!(inserted, segments.len());

    store.update_source_status(source_id, SourceStatus::Completed, None).await.unwrap();
    let counts = store.count_sources_by_status().await.unwrap();
    assert!(counts.iter().any(|(status, count)| status == "completed" && *count == 1));
}

#[tokio::test]
async fn two_speaker_interview_attributes_guest_turns_separately_from_the_primary() {
    let store = in_memory_store().await;
    let source = Source::new("ep-2", "Interview Episode", 20.0);
    let source_id = store.upsert_source(&source).await.unwrap();

    let words: Vec<AsrWord> = (0..30)
        .map(|i| AsrWord {
            start_sec: i as f64 * 0.6,
            end_sec: i as f64 * 0.6 + 0.5,
            text: format!("word{i}"),
        })
        .collect();
    let acquirer = TranscriptAcquirer::new(vec![], Arc::new(ScriptedAsr { words }));
    let (transcript, _) = acquirer.acquire("ep-2", Path::new("/tmp/ep-2.wav"), 20.0).await.unwrap();

    let diarizer = Diarizer::new(Arc::new(TwoSpeakerDiarizer), Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }));
    let outcome = diarizer.diarize(Path::new("/tmp/ep-2.wav"), 20.0, DiarizeHint::default()).await;
    assert_eq!(outcome.turns.len(), 2);

    let profiles = Arc::new(ProfileCache::new());
    profiles.replace_all(vec![primary_profile()]).await;
    let identifier = SpeakerIdentifier::new(Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }), profiles, SpeakerIdConfig::default());
    let identified = identifier.identify(Path::new("/tmp/ep-2.wav"), &outcome.turns).await.unwrap();

    let labels: Vec<&str> = identified.iter().map(|t| t.speaker_label.as_str()).collect();
    assert!(labels.contains(&"Chaffee"));
    assert!(labels.iter().any(|&l| l != "Chaffee"));

    let builder = SegmentBuilder::new(SegmentConfig { min_chars: 1, max_chars: 1000, hard_cap_chars: 2000, ..SegmentConfig::default() });
    let segments = builder.build(source_id, &transcript, &identified);
    let distinct_labels: std::collections::HashSet<&str> =
        segments.iter().map(|s| s.speaker_label.as_str()).collect();
    assert!(distinct_labels.len() >= 2);

    let inserted = store.insert_segments(&segments, 512).await.unwrap();
    assert_eq!(inserted, segments.len());
}

#[tokio::test]
async fn reingesting_the_same_source_and_segments_is_idempotent() {
    let store = in_memory_store().await;
    let mut source = Source::new("ep-3", "Replayed Episode", 20.0);
    let source_id = store.upsert_source(&source).await.unwrap();
    source.id = Some(source_id);

    let segment = chaffee_ingest::types::Segment {
        source_id,
        ordinal: 0,
        start_sec: 0.0,
        end_sec: 5.0,
        text: "hello there".to_string(),
        speaker_label: "Chaffee".to_string(),
        speaker_confidence: 0.9,
        voice_embedding: Some(vec![0.0; VOICE_DIMENSIONS]),
        text_embedding: Some(vec![0.0; TEXT_DIMENSIONS]),
        text_embedding_model_key: "stub-text-embedder-v1".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    let first_pass = store.insert_segments(std::slice::from_ref(&segment), 512).await.unwrap();
    assert_eq!(first_pass, 1);

    // Same source re-run after reingest: identical segment content upserts
    // onto the same row rather than duplicating it.
    store.update_source_status(source_id, SourceStatus::Pending, None).await.unwrap();
    let second_pass = store.insert_segments(std::slice::from_ref(&segment), 512).await.unwrap();
    assert_eq!(second_pass, 1);

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments WHERE source_id = ?")
        .bind(source_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 1);
}

#[tokio::test]
async fn dimension_mismatch_across_a_batch_rejects_the_whole_batch() {
    let store = in_memory_store().await;
    let source = Source::new("ep-4", "Bad Embeddings", 10.0);
    let source_id = store.upsert_source(&source).await.unwrap();

    let good = chaffee_ingest::types::Segment {
        source_id,
        ordinal: 0,
        start_sec: 0.0,
        end_sec: 5.0,
        text: "fine".to_string(),
        speaker_label: "Chaffee".to_string(),
        speaker_confidence: 0.9,
        voice_embedding: Some(vec![0.0; VOICE_DIMENSIONS]),
        text_embedding: Some(vec![0.0; TEXT_DIMENSIONS]),
        text_embedding_model_key: "stub-text-embedder-v1".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let mut bad = good.clone();
    bad.ordinal = 1;
    bad.start_sec = 5.0;
    bad.end_sec = 8.0;
    bad.text_embedding = Some(vec![0.0; TEXT_DIMENSIONS + 1]);

    let result = store.insert_segments(&[good, bad], 512).await;
    assert!(result.is_err());

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments WHERE source_id = ?")
        .bind(source_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 0, "a rejected batch must not partially persist");
}

#[tokio::test]
async fn embedding_failure_propagates_as_a_hard_error_with_a_stable_failure_reason() {
    struct AlwaysFailsTextEmbedder;
    #[async_trait]
    impl TextEmbeddingModel for AlwaysFailsTextEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("simulated GPU OOM")
        }
        fn model_key(&self) -> &str {
            "always-fails"
        }
        fn dimensions(&self) -> usize {
            TEXT_DIMENSIONS
        }
    }

    let embedder = TextEmbedder::new(Arc::new(AlwaysFailsTextEmbedder), 8);
    let texts = vec!["one".to_string(), "two".to_string()];
    let result = embedder.embed(&texts).await;
    let err = result.unwrap_err();
    assert_eq!(err.failure_reason().as_deref(), Some("embedding"));
}

struct SingleSourceLister(SourceDescriptor);

#[async_trait]
impl SourceDiscoveryBackend for SingleSourceLister {
    async fn list(
        &self,
        _channel_ref: &str,
        _since: Option<chrono::DateTime<chrono::Utc>>,
        _limit: Option<usize>,
    ) -> anyhow::Result<Vec<SourceDescriptor>> {
        Ok(vec![self.0.clone()])
    }
}

struct PanicsIfCalledAudioBackend;

#[async_trait]
impl AudioSourceBackend for PanicsIfCalledAudioBackend {
    async fn fetch_best_audio(&self, _external_id: &str) -> anyhow::Result<FetchedAudio> {
        panic!("audio fetch must not run for a source skipped on an unchanged fingerprint");
    }
}

struct EmptyProfileStore;

#[async_trait]
impl VoiceProfileStore for EmptyProfileStore {
    async fn load_all(&self) -> anyhow::Result<Vec<VoiceProfile>> {
        Ok(vec![])
    }
}

fn test_config(database_url: &str) -> Config {
    Config {
        skip_shorts: false,
        max_audio_duration_sec: 3600.0,
        assume_monologue: false,
        text_embedding_model_key: "stub-text-embedder-v1".to_string(),
        text_embedding_dimensions: TEXT_DIMENSIONS,
        voice_embedding_dimensions: VOICE_DIMENSIONS,
        cleanup_audio_after_processing: false,
        database_url: database_url.to_string(),
        data_dir: std::env::temp_dir(),
        segment: SegmentConfig { min_chars: 1, max_chars: 1000, hard_cap_chars: 2000, ..SegmentConfig::default() },
        speaker: SpeakerIdConfig::default(),
        pools: PoolConfig { io_workers: 2, gpu_workers: 1, db_workers: 2, insert_batch_size: 512, text_embed_batch_size: 64 },
    }
}

#[tokio::test]
async fn a_completed_source_with_an_unchanged_fingerprint_is_skipped_before_any_fetch() {
    let store = Arc::new(in_memory_store().await);

    let descriptor = SourceDescriptor {
        external_id: "ep-already-done".to_string(),
        title: "Already Ingested".to_string(),
        publish_instant: chrono::Utc::now(),
        duration_sec: 600.0,
        is_live_or_upcoming: false,
        is_members_only: false,
        has_owner_captions: false,
    };

    // Seed the store as if a prior run had already completed this source
    // with the fingerprint the current model configuration would produce.
    let mut seeded = Source::new(descriptor.external_id.clone(), descriptor.title.clone(), descriptor.duration_sec);
    let text_embedder = TextEmbedder::new(Arc::new(StubTextEmbedder { calls: AtomicUsize::new(0) }), 64);
    let diarizer_for_fingerprint =
        Diarizer::new(Arc::new(MonologueDiarizer), Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }));
    seeded.content_fingerprint = chaffee_ingest::types::compute_content_fingerprint(
        &descriptor.external_id,
        &[text_embedder.model_key(), &diarizer_for_fingerprint.voice_embedding_dimensions().to_string()],
    );
    let seeded_id = store.upsert_source(&seeded).await.unwrap();
    store.update_source_status(seeded_id, SourceStatus::Completed, None).await.unwrap();

    let lister = SourceLister::new(Arc::new(SingleSourceLister(descriptor)), Arc::new(SingleSourceLister(
        SourceDescriptor {
            external_id: "unused".to_string(),
            title: "unused".to_string(),
            publish_instant: chrono::Utc::now(),
            duration_sec: 0.0,
            is_live_or_upcoming: false,
            is_members_only: false,
            has_owner_captions: false,
        },
    )));

    let stages = PipelineStages {
        audio_fetcher: chaffee_ingest::audio_fetcher::AudioFetcher::new(Arc::new(PanicsIfCalledAudioBackend), 3600.0),
        transcript_acquirer: TranscriptAcquirer::new(vec![], Arc::new(ScriptedAsr { words: vec![] })),
        diarizer: Diarizer::new(Arc::new(MonologueDiarizer), Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 })),
        speaker_identifier: SpeakerIdentifier::new(
            Arc::new(TwoVoiceEmbedder { split_at_sec: 10.0 }),
            Arc::new(ProfileCache::new()),
            SpeakerIdConfig::default(),
        ),
        segment_builder: SegmentBuilder::new(SegmentConfig::default()),
        text_embedder,
    };

    let config = test_config("sqlite::memory:");
    let orchestrator = Orchestrator::new(
        lister,
        stages,
        store.clone(),
        Arc::new(EmptyProfileStore),
        Arc::new(ProfileCache::new()),
        config,
    );

    let summary = orchestrator
        .run("channel-ref", tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.sources_completed, 1);
    assert_eq!(summary.sources_failed, 0);
}
