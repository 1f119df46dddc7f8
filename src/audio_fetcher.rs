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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::contracts::AudioSourceBackend;
use crate::error::IngestError;
use crate::types::AudioArtifact;

const MAX_FETCH_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const TARGET_SAMPLE_RATE: u32 = 16_000;
const TARGET_CHANNELS: u16 = 1;

/// Downloads the best available audio track and transcodes it to 16 kHz
/// mono PCM WAV. The only component permitted to write audio files;
/// the orchestrator's cleanup tracker is responsible for deleting them.
pub struct AudioFetcher {
    backend: Arc<dyn AudioSourceBackend>,
    max_duration_sec: f64,
}

impl AudioFetcher {
    pub fn new(backend: Arc<dyn AudioSourceBackend>, max_duration_sec: f64) -> Self {
        Self { backend, max_duration_sec }
    }

    pub async fn fetch(
        &self,
        external_id: &str,
        dest_wav_path: &Path,
    ) -> Result<AudioArtifact, IngestError> {
        let fetched = self.fetch_with_retry(external_id).await?;

        if fetched.advertised_duration_sec > self.max_duration_sec {
            return Err(IngestError::SourceSkipped(format!(
                "advertised duration {:.1}s exceeds max_audio_duration_sec {:.1}s",
                fetched.advertised_duration_sec, self.max_duration_sec
            )));
        }

        let raw_path = dest_wav_path.with_extension(format!("raw.{}", fetched.container_hint));
        write_bytes(&raw_path, &fetched.bytes)
            .await
            .map_err(|e| IngestError::FetchFailure(format!("failed to write downloaded bytes: {e}")))?;

        transcode_to_wav(&raw_path, dest_wav_path)
            .await
            .map_err(|e| IngestError::FetchFailure(format!("transcode failed: {e}")))?;

        let _ = tokio::fs::remove_file(&raw_path).await;

        let (measured_duration, sample_rate, channels) =
            measure_wav(dest_wav_path).map_err(|e| {
                IngestError::FetchFailure(format!("failed to read transcoded wav: {e}"))
            })?;

        if measured_duration > self.max_duration_sec {
            let _ = tokio::fs::remove_file(dest_wav_path).await;
            return Err(IngestError::SourceSkipped(format!(
                "measured duration {measured_duration:.1}s exceeds max_audio_duration_sec {:.1}s",
                self.max_duration_sec
            )));
        }

        let metadata = tokio::fs::metadata(dest_wav_path)
            .await
            .map_err(|e| IngestError::FetchFailure(format!("fetched file unreadable: {e}")))?;
        if metadata.len() == 0 {
            return Err(IngestError::FetchFailure("fetched file is empty".to_string()));
        }

        Ok(AudioArtifact {
            path: dest_wav_path.to_path_buf(),
            sample_rate,
            channels,
            duration_sec: measured_duration,
            cleanup_on_success: true,
        })
    }

    async fn fetch_with_retry(
        &self,
        external_id: &str,
    ) -> Result<crate::contracts::FetchedAudio, IngestError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            match self.backend.fetch_best_audio(external_id).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    warn!(attempt, error = %e, "audio fetch attempt failed");
                    last_error = Some(e);
                    if attempt < MAX_FETCH_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(IngestError::FetchFailure(format!(
            "exhausted {MAX_FETCH_ATTEMPTS} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

async fn write_bytes(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    Ok(())
}

/// Transcodes via an `ffmpeg` subprocess, spawned and awaited with a
/// `tokio::process::Command` + timeout-then-kill idiom: a runaway transcode
/// is killed rather than left to block the worker indefinitely.
async fn transcode_to_wav(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(src)
        .arg("-ac")
        .arg(TARGET_CHANNELS.to_string())
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg(dest)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let mut child = cmd.spawn()?;

    let status = tokio::select! {
        result = child.wait() => result?,
        _ = tokio::time::sleep(Duration::from_secs(20 * 60)) => {
            let _ = child.kill().await;
            anyhow::bail!("ffmpeg transcode timed out");
        }
    };

    if !status.success() {
        anyhow::bail!("ffmpeg exited with {status}");
    }
    info!(dest = %dest.display(), "transcoded audio to 16kHz mono wav");
    Ok(())
}

fn measure_wav(path: &Path) -> anyhow::Result<(f64, u32, u16)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let duration_sec = reader.duration() as f64 / spec.sample_rate as f64;
    Ok((duration_sec, spec.sample_rate, spec.channels))
}

pub fn default_fetch_dest(data_dir: &Path, external_id: &str) -> PathBuf {
    data_dir.join("audio").join(format!("{external_id}.wav"))
}
