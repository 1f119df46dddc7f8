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

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::IngestError;
use crate::types::{Segment, Source, SourceStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    publish_instant TEXT NOT NULL,
    duration_sec REAL NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    content_fingerprint TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segments (
    source_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    start_sec REAL NOT NULL,
    end_sec REAL NOT NULL,
    text TEXT NOT NULL,
    speaker_label TEXT NOT NULL,
    speaker_confidence REAL NOT NULL,
    voice_embedding BLOB,
    text_embedding BLOB,
    text_embedding_model_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source_id, start_sec, end_sec, text)
);

CREATE TABLE IF NOT EXISTS cached_voice_embeddings (
    source_id INTEGER NOT NULL,
    start_sec_rounded INTEGER NOT NULL,
    end_sec_rounded INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    UNIQUE(source_id, start_sec_rounded, end_sec_rounded)
);
"#;

/// Idempotent persistence with transaction recovery. Uses a pooled
/// `sqlx::SqlitePool`; vector columns are `bincode`-serialized BLOBs (no
/// native vector-column extension is assumed), and similarity ranking is
/// computed in Rust over deserialized vectors rather than pushed into SQL.
pub struct SegmentStore {
    pool: SqlitePool,
    text_embedding_dimensions: usize,
    voice_embedding_dimensions: usize,
}

impl SegmentStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        text_embedding_dimensions: usize,
        voice_embedding_dimensions: usize,
    ) -> anyhow::Result<Self> {
        let options: SqliteConnectOptions = database_url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, text_embedding_dimensions, voice_embedding_dimensions })
    }

    pub async fn upsert_source(&self, source: &Source) -> Result<i64, IngestError> {
        let mut conn = self.acquire_healthy().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO sources (external_id, title, publish_instant, duration_sec, kind, status, failure_reason, content_fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                title = excluded.title,
                publish_instant = excluded.publish_instant,
                duration_sec = excluded.duration_sec,
                kind = excluded.kind,
                status = excluded.status,
                failure_reason = excluded.failure_reason,
                content_fingerprint = excluded.content_fingerprint
            RETURNING id
            "#,
        )
        .bind(&source.external_id)
        .bind(&source.title)
        .bind(source.publish_instant.to_rfc3339())
        .bind(source.duration_sec)
        .bind(source.kind.to_string())
        .bind(source.status.to_string())
        .bind(&source.failure_reason)
        .bind(&source.content_fingerprint)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| IngestError::PersistFailure(format!("upsert_source failed: {e}")))?;

        row.try_get::<i64, _>("id")
            .map_err(|e| IngestError::PersistFailure(format!("upsert_source returned no id: {e}")))
    }

    pub async fn update_source_status(
        &self,
        source_id: i64,
        status: SourceStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), IngestError> {
        let mut conn = self.acquire_healthy().await?;
        sqlx::query("UPDATE sources SET status = ?, failure_reason = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(failure_reason)
            .bind(source_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| IngestError::PersistFailure(format!("update_source_status failed: {e}")))?;
        Ok(())
    }

    pub async fn count_sources_by_status(&self) -> Result<Vec<(String, i64)>, IngestError> {
        let mut conn = self.acquire_healthy().await?;
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM sources GROUP BY status ORDER BY status")
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| IngestError::PersistFailure(format!("count_sources_by_status failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| IngestError::PersistFailure(format!("missing status column: {e}")))?;
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| IngestError::PersistFailure(format!("missing count column: {e}")))?;
                Ok((status, count))
            })
            .collect()
    }

    /// Looks up a previously ingested source's status and content
    /// fingerprint by external id, used to decide whether a listed source
    /// needs reprocessing at all before its pipeline run starts.
    pub async fn fetch_status_and_fingerprint(
        &self,
        external_id: &str,
    ) -> Result<Option<(SourceStatus, String)>, IngestError> {
        let mut conn = self.acquire_healthy().await?;
        let row = sqlx::query("SELECT status, content_fingerprint FROM sources WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| IngestError::PersistFailure(format!("fetch_status_and_fingerprint failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let status_str: String = row
            .try_get("status")
            .map_err(|e| IngestError::PersistFailure(format!("missing status column: {e}")))?;
        let fingerprint: String = row
            .try_get("content_fingerprint")
            .map_err(|e| IngestError::PersistFailure(format!("missing content_fingerprint column: {e}")))?;
        let status: SourceStatus = status_str
            .parse()
            .map_err(|e| IngestError::PersistFailure(format!("unparseable status {status_str}: {e}")))?;
        Ok(Some((status, fingerprint)))
    }

    /// Batches rows inside a single transaction per batch; on any batch
    /// error, rolls back and drops the connection so the pool replaces it,
    /// then re-raises.
    pub async fn insert_segments(
        &self,
        segments: &[Segment],
        batch_size: usize,
    ) -> Result<usize, IngestError> {
        for seg in segments {
            if let Some(emb) = &seg.text_embedding {
                if emb.len() != self.text_embedding_dimensions {
                    return Err(IngestError::EmbeddingDimensionMismatch {
                        expected: self.text_embedding_dimensions,
                        actual: emb.len(),
                    });
                }
            }
            if let Some(emb) = &seg.voice_embedding {
                if emb.len() != self.voice_embedding_dimensions {
                    return Err(IngestError::EmbeddingDimensionMismatch {
                        expected: self.voice_embedding_dimensions,
                        actual: emb.len(),
                    });
                }
            }
        }

        let mut total = 0usize;
        for chunk in segments.chunks(batch_size.max(1)) {
            let mut conn = self.acquire_healthy().await?;
            let mut tx = conn
                .begin()
                .await
                .map_err(|e| IngestError::PersistFailure(format!("begin transaction failed: {e}")))?;

            for seg in chunk {
                let voice_blob = seg.voice_embedding.as_ref().map(|v| bincode::serialize(v)).transpose()
                    .map_err(|e| IngestError::PersistFailure(format!("serialize voice embedding: {e}")))?;
                let text_blob = seg.text_embedding.as_ref().map(|v| bincode::serialize(v)).transpose()
                    .map_err(|e| IngestError::PersistFailure(format!("serialize text embedding: {e}")))?;

                let result = sqlx::query(
                    r#"
                    INSERT INTO segments (source_id, ordinal, start_sec, end_sec, text, speaker_label, speaker_confidence, voice_embedding, text_embedding, text_embedding_model_key, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(source_id, start_sec, end_sec, text) DO UPDATE SET
                        ordinal = excluded.ordinal,
                        speaker_label = excluded.speaker_label,
                        speaker_confidence = excluded.speaker_confidence,
                        voice_embedding = excluded.voice_embedding,
                        text_embedding = excluded.text_embedding,
                        text_embedding_model_key = excluded.text_embedding_model_key,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(seg.source_id)
                .bind(seg.ordinal)
                .bind(seg.start_sec)
                .bind(seg.end_sec)
                .bind(&seg.text)
                .bind(&seg.speaker_label)
                .bind(seg.speaker_confidence)
                .bind(voice_blob)
                .bind(text_blob)
                .bind(&seg.text_embedding_model_key)
                .bind(seg.created_at.to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await;

                if let Err(e) = result {
                    // tx drops here without commit, rolling back; conn is
                    // dropped too so the pool never hands this connection
                    // back out in a half-committed state.
                    return Err(IngestError::PersistFailure(format!("insert_segments batch failed: {e}")));
                }
            }

            tx.commit()
                .await
                .map_err(|e| IngestError::PersistFailure(format!("commit failed: {e}")))?;
            total += chunk.len();
        }

        Ok(total)
    }

    /// Fetches cached voice embeddings in a read-only transaction; on any
    /// failure, rolls back and proceeds without cache rather than
    /// propagating the error.
    pub async fn fetch_cached_voice_embeddings(
        &self,
        source_id: i64,
    ) -> HashMap<(i64, i64), Vec<f32>> {
        match self.try_fetch_cached_voice_embeddings(source_id).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, source_id, "failed to read voice embedding cache, proceeding without it");
                HashMap::new()
            }
        }
    }

    async fn try_fetch_cached_voice_embeddings(
        &self,
        source_id: i64,
    ) -> anyhow::Result<HashMap<(i64, i64), Vec<f32>>> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let rows = sqlx::query(
            "SELECT start_sec_rounded, end_sec_rounded, embedding FROM cached_voice_embeddings WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.rollback().await?; // read-only: always rollback, never commit

        let mut out = HashMap::new();
        for row in rows {
            let start: i64 = row.try_get("start_sec_rounded")?;
            let end: i64 = row.try_get("end_sec_rounded")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let embedding: Vec<f32> = bincode::deserialize(&blob)?;
            out.insert((start, end), embedding);
        }
        Ok(out)
    }

    pub async fn cache_voice_embedding(
        &self,
        source_id: i64,
        start_sec_rounded: i64,
        end_sec_rounded: i64,
        embedding: &[f32],
    ) -> Result<(), IngestError> {
        let mut conn = self.acquire_healthy().await?;
        let blob = bincode::serialize(embedding)
            .map_err(|e| IngestError::PersistFailure(format!("serialize cached embedding: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO cached_voice_embeddings (source_id, start_sec_rounded, end_sec_rounded, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, start_sec_rounded, end_sec_rounded) DO UPDATE SET embedding = excluded.embedding
            "#,
        )
        .bind(source_id)
        .bind(start_sec_rounded)
        .bind(end_sec_rounded)
        .bind(blob)
        .execute(&mut *conn)
        .await
        .map_err(|e| IngestError::PersistFailure(format!("cache_voice_embedding failed: {e}")))?;
        Ok(())
    }

    /// Acquires a pooled connection and checks its transaction state before
    /// use; a connection left "in error" by a prior failure is rolled back
    /// here rather than silently poisoning this insert too.
    async fn acquire_healthy(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, IngestError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| IngestError::PersistFailure(format!("acquire connection failed: {e}")))?;

        if sqlx::query("SELECT 1").execute(&mut *conn).await.is_err() {
            warn!("connection failed health check, issuing rollback before reuse");
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        }

        Ok(conn)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub fn round_for_cache_key(v: f64) -> i64 {
    v.round() as i64
}
