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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use chaffee_ingest::config::Config;
use chaffee_ingest::orchestrator::{Orchestrator, PipelineStages};
use chaffee_ingest::segment_store::SegmentStore;
use chaffee_ingest::speaker_identifier::ProfileCache;
use chaffee_ingest::source_lister::SourceLister;

/// Podcast catalog ingestion pipeline: fetch, transcribe, diarize,
/// identify speakers, embed, and persist.
#[derive(Parser)]
#[command(name = "ingest")]
#[command(version)]
#[command(about = "Ingests a channel's catalog into searchable, speaker-attributed segments")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ingestion pass over a channel's catalog (default)
    Run {
        /// Channel identifier or reference understood by the configured
        /// source-discovery backend
        channel_ref: String,
    },

    /// Show source counts by status
    Status,

    /// Reset a source's status to Pending so the next run reprocesses it
    Reingest {
        /// Database id of the source to reingest
        source_id: i64,
    },

    /// List known voice profiles
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().await?;
    let config = Config::load().await.context("failed to load configuration")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run { channel_ref: String::new() }) {
        Commands::Run { channel_ref } if !channel_ref.is_empty() => run(config, &channel_ref).await,
        Commands::Run { .. } => {
            eprintln!("a channel reference is required: ingest run <channel_ref>");
            std::process::exit(2);
        }
        Commands::Status => show_status(config).await,
        Commands::Reingest { source_id } => reingest(config, source_id).await,
        Commands::Profiles => list_profiles(config).await,
    }
}

async fn run(config: Config, channel_ref: &str) -> Result<()> {
    tracing::info!(channel_ref, "starting ingestion run");

    let store = Arc::new(
        SegmentStore::connect(
            &config.database_url,
            (config.pools.db_workers as u32).max(1),
            config.text_embedding_dimensions,
            config.voice_embedding_dimensions,
        )
        .await?,
    );

    // Backends (source discovery, audio fetch, ASR, diarization, voice and
    // text embedding, profile storage) are injected here from whichever
    // concrete integrations are compiled in; the pipeline itself only ever
    // talks to their trait contracts.
    let (lister, stages, profile_store, profiles) = build_pipeline(&config)?;

    let orchestrator = Orchestrator::new(lister, stages, store, profile_store, profiles, config);

    let cancellation = CancellationToken::new();
    let cancel_on_ctrl_c = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, draining in-flight sources before exit");
            cancel_on_ctrl_c.cancel();
        }
    });

    let summary = orchestrator.run(channel_ref, cancellation).await?;

    println!(
        "ingested {} of {} sources ({} skipped, {} failed) in {:.1}s",
        summary.sources_completed,
        summary.sources_total,
        summary.sources_skipped,
        summary.sources_failed,
        summary.elapsed.as_secs_f64()
    );
    if !summary.top_failure_reasons.is_empty() {
        println!("top failure reasons:");
        for (reason, count) in summary.top_failure_reasons.iter().take(5) {
            println!("  {reason}: {count}");
        }
    }
    println!("GPU queue high-water mark: {}", summary.gpu_queue_high_water_mark);

    Ok(())
}

async fn show_status(config: Config) -> Result<()> {
    let store = SegmentStore::connect(
        &config.database_url,
        (config.pools.db_workers as u32).max(1),
        config.text_embedding_dimensions,
        config.voice_embedding_dimensions,
    )
    .await?;
    let counts = store.count_sources_by_status().await?;
    for (status, count) in counts {
        println!("{status:>12}: {count}");
    }
    Ok(())
}

async fn reingest(config: Config, source_id: i64) -> Result<()> {
    let store = SegmentStore::connect(
        &config.database_url,
        (config.pools.db_workers as u32).max(1),
        config.text_embedding_dimensions,
        config.voice_embedding_dimensions,
    )
    .await?;
    store
        .update_source_status(source_id, chaffee_ingest::types::SourceStatus::Pending, None)
        .await?;
    println!("source {source_id} reset to pending");
    Ok(())
}

async fn list_profiles(config: Config) -> Result<()> {
    let (_, _, profile_store, profiles) = build_pipeline(&config)?;
    let loaded = profile_store.load_all().await?;
    profiles.replace_all(loaded).await;
    for profile in profiles.all().await {
        println!("{} (dimensions: {})", profile.name, profile.centroid.len());
    }
    Ok(())
}

/// Wires the trait-object backends this deployment uses into the pipeline's
/// stage objects. Kept in one place so swapping a backend (e.g. a different
/// ASR provider) never touches the orchestrator itself.
#[allow(clippy::type_complexity)]
fn build_pipeline(
    config: &Config,
) -> Result<(
    SourceLister,
    PipelineStages,
    Arc<dyn chaffee_ingest::contracts::VoiceProfileStore>,
    Arc<ProfileCache>,
)> {
    anyhow::bail!(
        "no source-discovery, audio, ASR, diarization, embedding, or profile-store backend is \
         compiled into this binary yet; link concrete implementations of the traits in \
         chaffee_ingest::contracts and construct them here (config: {:?})",
        config.data_dir
    )
}

async fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".chaffee-ingest")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "chaffee-ingest.log");

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("chaffee_ingest=debug".parse()?)
                        .add_directive("info".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("chaffee_ingest=info".parse()?)
                        .add_directive("warn".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;
    tracing::info!(log_dir = %log_dir.display(), "logging initialized");
    Ok(())
}
