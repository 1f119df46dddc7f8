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

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::contracts::{SourceDescriptor, SourceDiscoveryBackend};
use crate::error::IngestError;
use crate::types::{Source, SourceKind};

const SHORT_SOURCE_DURATION_SEC: f64 = 120.0;

/// Enumerates candidate audio sources and their metadata. Tries the
/// preferred backend first, falls back to the secondary only on an actual
/// backend error (not merely a short/empty result), and normalizes both
/// outputs into `Source` descriptors.
pub struct SourceLister {
    primary: Arc<dyn SourceDiscoveryBackend>,
    fallback: Arc<dyn SourceDiscoveryBackend>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
    pub skip_shorts: bool,
}

impl SourceLister {
    pub fn new(primary: Arc<dyn SourceDiscoveryBackend>, fallback: Arc<dyn SourceDiscoveryBackend>) -> Self {
        Self { primary, fallback }
    }

    pub async fn list(&self, channel_ref: &str, opts: ListOptions) -> Result<Vec<Source>, IngestError> {
        let descriptors = match self.primary.list(channel_ref, opts.since, opts.limit).await {
            Ok(d) => d,
            Err(primary_err) => {
                warn!(error = %primary_err, "primary source-discovery backend failed, trying fallback");
                match self.fallback.list(channel_ref, opts.since, opts.limit).await {
                    Ok(d) => d,
                    Err(fallback_err) => {
                        return Err(IngestError::SourceDiscoveryError(format!(
                            "both source-discovery backends failed: primary={primary_err}, fallback={fallback_err}"
                        )));
                    }
                }
            }
        };

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(descriptors.len());

        for d in descriptors {
            if !seen.insert(d.external_id.clone()) {
                continue;
            }
            if d.is_live_or_upcoming || d.is_members_only {
                continue;
            }
            if opts.skip_shorts && d.duration_sec < SHORT_SOURCE_DURATION_SEC {
                continue;
            }
            out.push(descriptor_to_source(d));
        }

        out.sort_by(|a, b| b.publish_instant.cmp(&a.publish_instant));
        Ok(out)
    }
}

fn descriptor_to_source(d: SourceDescriptor) -> Source {
    let mut source = Source::new(d.external_id, d.title, d.duration_sec);
    source.publish_instant = d.publish_instant;
    source.kind = SourceKind::Unknown;
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    fn descriptor(id: &str, duration: f64, live: bool, members_only: bool) -> SourceDescriptor {
        SourceDescriptor {
            external_id: id.to_string(),
            title: format!("title-{id}"),
            publish_instant: Utc::now(),
            duration_sec: duration,
            is_live_or_upcoming: live,
            is_members_only: members_only,
            has_owner_captions: false,
        }
    }

    struct FixedBackend(Vec<SourceDescriptor>);
    #[async_trait]
    impl SourceDiscoveryBackend for FixedBackend {
        async fn list(
            &self,
            _channel_ref: &str,
            _since: Option<chrono::DateTime<chrono::Utc>>,
            _limit: Option<usize>,
        ) -> anyhow::Result<Vec<SourceDescriptor>> {
            Ok(self.0.clone())
        }
    }

    struct FailingBackend;
    #[async_trait]
    impl SourceDiscoveryBackend for FailingBackend {
        async fn list(
            &self,
            _channel_ref: &str,
            _since: Option<chrono::DateTime<chrono::Utc>>,
            _limit: Option<usize>,
        ) -> anyhow::Result<Vec<SourceDescriptor>> {
            anyhow::bail!("api unavailable")
        }
    }

    #[tokio::test]
    async fn a_source_of_exactly_120s_is_accepted_with_skip_shorts() {
        let backend = Arc::new(FixedBackend(vec![descriptor("a", 120.0, false, false)]));
        let lister = SourceLister::new(backend.clone(), backend);
        let sources = lister
            .list("chan", ListOptions { skip_shorts: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn a_source_under_120s_is_excluded_with_skip_shorts() {
        let backend = Arc::new(FixedBackend(vec![descriptor("a", 119.9, false, false)]));
        let lister = SourceLister::new(backend.clone(), backend);
        let sources = lister
            .list("chan", ListOptions { skip_shorts: true, ..Default::default() })
            .await
            .unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn live_and_members_only_sources_are_excluded_by_default() {
        let backend = Arc::new(FixedBackend(vec![
            descriptor("live", 300.0, true, false),
            descriptor("members", 300.0, false, true),
            descriptor("normal", 300.0, false, false),
        ]));
        let lister = SourceLister::new(backend.clone(), backend);
        let sources = lister.list("chan", ListOptions::default()).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].external_id, "normal");
    }

    #[tokio::test]
    async fn duplicates_by_external_id_are_removed() {
        let backend = Arc::new(FixedBackend(vec![
            descriptor("a", 300.0, false, false),
            descriptor("a", 300.0, false, false),
        ]));
        let lister = SourceLister::new(backend.clone(), backend);
        let sources = lister.list("chan", ListOptions::default()).await.unwrap();
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_secondary_backend_when_primary_errors() {
        let fallback = Arc::new(FixedBackend(vec![descriptor("a", 300.0, false, false)]));
        let lister = SourceLister::new(Arc::new(FailingBackend), fallback);
        let sources = lister.list("chan", ListOptions::default()).await.unwrap();
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn both_backends_failing_raises_a_source_discovery_error() {
        let lister = SourceLister::new(Arc::new(FailingBackend), Arc::new(FailingBackend));
        let result = lister.list("chan", ListOptions::default()).await;
        assert!(matches!(result, Err(IngestError::SourceDiscoveryError(_))));
    }

    #[tokio::test]
    async fn newest_first_ordering_by_default() {
        let older = {
            let mut d = descriptor("old", 300.0, false, false);
            d.publish_instant = Utc::now() - Duration::days(10);
            d
        };
        let newer = descriptor("new", 300.0, false, false);
        let backend = Arc::new(FixedBackend(vec![older, newer]));
        let lister = SourceLister::new(backend.clone(), backend);
        let sources = lister.list("chan", ListOptions::default()).await.unwrap();
        assert_eq!(sources[0].external_id, "new");
        assert_eq!(sources[1].external_id, "old");
    }
}
