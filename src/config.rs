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

use anyhow::{Context, Result};
use dirs::home_dir;
use std::env;
use std::path::PathBuf;

/// Segmentation geometry knobs.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    pub hard_cap_chars: usize,
    pub max_gap_sec: f64,
    pub max_merge_duration_sec: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_chars: 1100,
            max_chars: 1400,
            hard_cap_chars: 1800,
            max_gap_sec: 5.0,
            max_merge_duration_sec: 120.0,
        }
    }
}

/// Speaker-identification thresholds.
#[derive(Debug, Clone)]
pub struct SpeakerIdConfig {
    pub primary_voice_profile_name: String,
    pub primary_min_similarity: f32,
    pub guest_min_similarity: f32,
    pub attribution_margin: f32,
    pub fast_path_similarity: f32,
    pub voice_embedding_batch_size: usize,
}

impl Default for SpeakerIdConfig {
    fn default() -> Self {
        Self {
            primary_voice_profile_name: "Chaffee".to_string(),
            primary_min_similarity: 0.62,
            guest_min_similarity: 0.82,
            attribution_margin: 0.05,
            fast_path_similarity: 0.434,
            voice_embedding_batch_size: 8,
        }
    }
}

/// Pool sizes for the three worker pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub io_workers: usize,
    pub gpu_workers: usize,
    pub db_workers: usize,
    pub insert_batch_size: usize,
    pub text_embed_batch_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            io_workers: 16,
            gpu_workers: 1,
            db_workers: 12,
            insert_batch_size: 512,
            text_embed_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub skip_shorts: bool,
    pub max_audio_duration_sec: f64,
    pub assume_monologue: bool,
    pub text_embedding_model_key: String,
    pub text_embedding_dimensions: usize,
    pub voice_embedding_dimensions: usize,
    pub cleanup_audio_after_processing: bool,
    pub database_url: String,
    pub data_dir: PathBuf,
    pub segment: SegmentConfig,
    pub speaker: SpeakerIdConfig,
    pub pools: PoolConfig,
}

impl Config {
    /// Loads configuration from `.env` plus process environment. Every
    /// tunable has a sane default, and a missing or unparsable value falls
    /// back to it rather than aborting startup.
    pub async fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".chaffee-ingest")
            });
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}", data_dir.join("segments.db").display())
        });

        let skip_shorts = env_bool("SKIP_SHORTS", true);
        let max_audio_duration_sec = env_parse("MAX_AUDIO_DURATION_SEC", 3600.0);
        let assume_monologue = env_bool("ASSUME_MONOLOGUE", false);

        let text_embedding_model_key =
            env::var("TEXT_EMBEDDING_MODEL_KEY").unwrap_or_else(|_| "text-embed-3-small".to_string());
        let text_embedding_dimensions = env_parse("TEXT_EMBEDDING_DIMENSIONS", 768usize);
        let voice_embedding_dimensions = env_parse("VOICE_EMBEDDING_DIMENSIONS", 192usize);
        let cleanup_audio_after_processing = env_bool("CLEANUP_AUDIO_AFTER_PROCESSING", true);

        let segment = SegmentConfig {
            min_chars: env_parse("SEGMENT_MIN_CHARS", SegmentConfig::default().min_chars),
            max_chars: env_parse("SEGMENT_MAX_CHARS", SegmentConfig::default().max_chars),
            hard_cap_chars: env_parse("SEGMENT_HARD_CAP_CHARS", SegmentConfig::default().hard_cap_chars),
            max_gap_sec: env_parse("SEGMENT_MAX_GAP_SEC", SegmentConfig::default().max_gap_sec),
            max_merge_duration_sec: env_parse(
                "SEGMENT_MAX_MERGE_DURATION_SEC",
                SegmentConfig::default().max_merge_duration_sec,
            ),
        };

        let speaker = SpeakerIdConfig {
            primary_voice_profile_name: env::var("PRIMARY_VOICE_PROFILE_NAME")
                .unwrap_or_else(|_| SpeakerIdConfig::default().primary_voice_profile_name),
            primary_min_similarity: env_parse(
                "CHAFFEE_MIN_SIMILARITY",
                SpeakerIdConfig::default().primary_min_similarity,
            ),
            guest_min_similarity: env_parse(
                "GUEST_MIN_SIMILARITY",
                SpeakerIdConfig::default().guest_min_similarity,
            ),
            attribution_margin: env_parse(
                "ATTRIBUTION_MARGIN",
                SpeakerIdConfig::default().attribution_margin,
            ),
            fast_path_similarity: SpeakerIdConfig::default().fast_path_similarity,
            voice_embedding_batch_size: env_parse(
                "VOICE_EMBEDDING_BATCH_SIZE",
                SpeakerIdConfig::default().voice_embedding_batch_size,
            ),
        };

        let pools = PoolConfig {
            io_workers: env_parse("IO_WORKERS", PoolConfig::default().io_workers),
            gpu_workers: env_parse("GPU_WORKERS", PoolConfig::default().gpu_workers),
            db_workers: env_parse("DB_WORKERS", PoolConfig::default().db_workers),
            insert_batch_size: env_parse("INSERT_BATCH_SIZE", PoolConfig::default().insert_batch_size),
            text_embed_batch_size: env_parse(
                "TEXT_EMBED_BATCH_SIZE",
                PoolConfig::default().text_embed_batch_size,
            ),
        };

        Ok(Config {
            skip_shorts,
            max_audio_duration_sec,
            assume_monologue,
            text_embedding_model_key,
            text_embedding_dimensions,
            voice_embedding_dimensions,
            cleanup_audio_after_processing,
            database_url,
            data_dir,
            segment,
            speaker,
            pools,
        })
    }

    pub fn temp_audio_path(&self, source_external_id: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.data_dir
            .join("audio")
            .join(format!("{source_external_id}_{timestamp}.wav"))
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
