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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A classification tag assigned to a source by the lister/orchestrator,
/// used to pick sensible diarization hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Monologue,
    Interview,
    MonologueWithClips,
    Unknown,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Monologue => "monologue",
            SourceKind::Interview => "interview",
            SourceKind::MonologueWithClips => "monologue_with_clips",
            SourceKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a Source. Advances monotonically, except that
/// `Failed`/`Skipped` are terminal until an explicit reingest resets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    Pending,
    Fetched,
    Transcribed,
    Diarized,
    Embedded,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Fetched => "fetched",
            SourceStatus::Transcribed => "transcribed",
            SourceStatus::Diarized => "diarized",
            SourceStatus::Embedded => "embedded",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
            SourceStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "fetched" => Ok(SourceStatus::Fetched),
            "transcribed" => Ok(SourceStatus::Transcribed),
            "diarized" => Ok(SourceStatus::Diarized),
            "embedded" => Ok(SourceStatus::Embedded),
            "completed" => Ok(SourceStatus::Completed),
            "failed" => Ok(SourceStatus::Failed),
            "skipped" => Ok(SourceStatus::Skipped),
            other => Err(format!("unrecognized source status: {other}")),
        }
    }
}

/// An immutable external audio reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<i64>,
    pub external_id: String,
    pub title: String,
    pub publish_instant: DateTime<Utc>,
    pub duration_sec: f64,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub failure_reason: Option<String>,
    pub content_fingerprint: String,
}

impl Source {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>, duration_sec: f64) -> Self {
        Self {
            id: None,
            external_id: external_id.into(),
            title: title.into(),
            publish_instant: Utc::now(),
            duration_sec,
            kind: SourceKind::Unknown,
            status: SourceStatus::Pending,
            failure_reason: None,
            content_fingerprint: String::new(),
        }
    }
}

/// Hashes external id plus every model identifier currently selected for
/// ingestion into a stable fingerprint. A source whose fingerprint hasn't
/// changed since its last completed run needs no reprocessing; a changed
/// model identifier (a different ASR model, a re-trained embedder) changes
/// the fingerprint and forces the source through the pipeline again.
pub fn compute_content_fingerprint(external_id: &str, model_identifiers: &[&str]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    external_id.hash(&mut hasher);
    for identifier in model_identifiers {
        identifier.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// A local audio file reference, owned by the pipeline run for its lifetime.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub path: std::path::PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_sec: f64,
    pub cleanup_on_success: bool,
}

/// The tier that produced a transcript word, used to rank retrieval quality
/// (owner > platform > third-party > asr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    OwnerCaption,
    PlatformCaption,
    ThirdPartySubs,
    Asr,
}

impl Provenance {
    /// Lower rank sorts first, matching the retrieval ordering policy.
    pub fn rank(self) -> u8 {
        match self {
            Provenance::OwnerCaption => 0,
            Provenance::PlatformCaption => 1,
            Provenance::ThirdPartySubs => 2,
            Provenance::Asr => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub provenance: Provenance,
    pub confidence: f32,
}

impl WordTiming {
    pub fn midpoint(&self) -> f64 {
        (self.start_sec + self.end_sec) / 2.0
    }
}

/// A diarization-level non-overlapping time interval attributed to one cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub start_sec: f64,
    pub end_sec: f64,
    pub cluster_id: u32,
}

impl SpeakerTurn {
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_sec && t < self.end_sec
    }
}

/// A persistent named voice identity, read-only during ingestion.
#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub name: String,
    pub centroid: Vec<f32>,
    pub samples: Vec<Vec<f32>>,
    pub threshold_override: Option<f32>,
}

/// A per-segment voice embedding sample extracted from the segment's audio window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceEmbeddingSample {
    pub start_sec: f64,
    pub end_sec: f64,
    pub embedding: Vec<f32>,
}

/// The core persisted record per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub source_id: i64,
    pub ordinal: u32,
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub speaker_label: String,
    pub speaker_confidence: f32,
    pub voice_embedding: Option<Vec<f32>>,
    pub text_embedding: Option<Vec<f32>>,
    pub text_embedding_model_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const SPEAKER_UNKNOWN: &str = "Unknown";
pub const SPEAKER_GUEST: &str = "Guest";

/// A keyed lookup to avoid re-extracting voice embeddings across reruns.
#[derive(Debug, Clone)]
pub struct CachedVoiceEmbeddingKey {
    pub source_id: i64,
    pub start_sec_rounded: i64,
    pub end_sec_rounded: i64,
}
