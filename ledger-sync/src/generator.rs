//! Artifact generator: canonical record + live sections → `dashboard.md` text.

use std::time::Duration;

use chrono::{DateTime, Utc};

use ledger_core::{store, EntityRef, Loaded, Revision};
use ledger_renderer::{ArtifactContext, LiveSection, Renderer};

use crate::error::{blocking, SyncError};
use crate::live::SharedLiveSource;

/// Whether every part of the artifact could be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    Complete,
    /// Generation succeeded but some parts are missing or stale.
    /// `sections` names the failed live sections (and `cache` for a failed
    /// projection).
    Degraded { sections: Vec<String> },
}

impl GenerationStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, GenerationStatus::Degraded { .. })
    }

    /// Fold more failed parts into the status.
    pub fn degrade(self, parts: impl IntoIterator<Item = String>) -> Self {
        let mut sections = match self {
            GenerationStatus::Complete => Vec::new(),
            GenerationStatus::Degraded { sections } => sections,
        };
        sections.extend(parts);
        if sections.is_empty() {
            GenerationStatus::Complete
        } else {
            GenerationStatus::Degraded { sections }
        }
    }
}

/// A rendered artifact, not yet written.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub content: String,
    pub generated_at: DateTime<Utc>,
    /// Canonical revision the artifact was rendered from.
    pub revision: Revision,
    pub status: GenerationStatus,
}

/// Renders artifacts for any entity. Create once and share.
pub struct Generator {
    renderer: Renderer,
    sources: Vec<SharedLiveSource>,
    live_timeout: Duration,
}

impl Generator {
    pub fn new(renderer: Renderer, sources: Vec<SharedLiveSource>, live_timeout: Duration) -> Self {
        Self {
            renderer,
            sources,
            live_timeout,
        }
    }

    /// Load the canonical record and render the artifact.
    ///
    /// Canonical load errors propagate; live-source failures only degrade.
    pub async fn generate(&self, entity: &EntityRef) -> Result<GeneratedArtifact, SyncError> {
        let owned = entity.clone();
        let loaded = blocking(move || store::load(&owned).map_err(SyncError::from)).await?;
        self.generate_from(entity, &loaded).await
    }

    /// Render from an already loaded record.
    pub async fn generate_from(
        &self,
        entity: &EntityRef,
        loaded: &Loaded,
    ) -> Result<GeneratedArtifact, SyncError> {
        let (live, failed) = self.query_live(entity).await;
        let generated_at = Utc::now();
        let ctx = ArtifactContext::build(entity, &loaded.record, &loaded.revision, &live, generated_at);
        let content = self.renderer.render(&ctx)?;
        Ok(GeneratedArtifact {
            content,
            generated_at,
            revision: loaded.revision.clone(),
            status: GenerationStatus::Complete.degrade(failed),
        })
    }

    /// Query every live source, each bounded by the live timeout.
    ///
    /// Returns the sections in source order plus the keys that failed.
    pub async fn query_live(&self, entity: &EntityRef) -> (Vec<LiveSection>, Vec<String>) {
        let mut sections = Vec::with_capacity(self.sources.len());
        let mut failed = Vec::new();
        for source in &self.sources {
            let key = source.key().to_string();
            let result = tokio::time::timeout(self.live_timeout, source.query(entity)).await;
            let (items, degraded) = match result {
                Ok(Ok(items)) => (items, false),
                Ok(Err(err)) => {
                    tracing::warn!("live section '{key}' for {} failed: {err:#}", entity.id);
                    (Vec::new(), true)
                }
                Err(_) => {
                    tracing::warn!(
                        "live section '{key}' for {} timed out after {:?}",
                        entity.id,
                        self.live_timeout
                    );
                    (Vec::new(), true)
                }
            };
            if degraded {
                failed.push(key.clone());
            }
            sections.push(LiveSection {
                key,
                title: source.title().to_string(),
                items,
                degraded,
            });
        }
        (sections, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveSource;
    use async_trait::async_trait;
    use ledger_core::{CanonicalRecord, EntityType, Workspace};
    use ledger_renderer::marker::strip_marker;
    use ledger_renderer::LiveItem;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixed(&'static str);

    #[async_trait]
    impl LiveSource for Fixed {
        fn key(&self) -> &str {
            "meetings"
        }
        fn title(&self) -> &str {
            "Meetings"
        }
        async fn query(&self, _entity: &EntityRef) -> anyhow::Result<Vec<LiveItem>> {
            Ok(vec![LiveItem::new(self.0)])
        }
    }

    struct Failing;

    #[async_trait]
    impl LiveSource for Failing {
        fn key(&self) -> &str {
            "open-items"
        }
        fn title(&self) -> &str {
            "Open items"
        }
        async fn query(&self, _entity: &EntityRef) -> anyhow::Result<Vec<LiveItem>> {
            anyhow::bail!("tracker offline")
        }
    }

    struct Slow;

    #[async_trait]
    impl LiveSource for Slow {
        fn key(&self) -> &str {
            "slow"
        }
        fn title(&self) -> &str {
            "Slow"
        }
        async fn query(&self, _entity: &EntityRef) -> anyhow::Result<Vec<LiveItem>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![LiveItem::new("too late")])
        }
    }

    fn generator(sources: Vec<SharedLiveSource>) -> Generator {
        Generator::new(Renderer::new().unwrap(), sources, Duration::from_millis(200))
    }

    fn acme(ws: &Workspace) -> EntityRef {
        let acme = ws.create_entity(EntityType::Account, "Acme").unwrap();
        let mut record = CanonicalRecord::new(EntityType::Account);
        record.set_field("health", "green");
        store::save(&acme, &record, None).unwrap();
        acme
    }

    #[tokio::test]
    async fn generate_is_deterministic_modulo_marker() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let acme = acme(&ws);
        let gen = generator(vec![Arc::new(Fixed("QBR"))]);

        let a = gen.generate(&acme).await.unwrap();
        let b = gen.generate(&acme).await.unwrap();
        assert_eq!(strip_marker(&a.content), strip_marker(&b.content));
        assert_eq!(a.status, GenerationStatus::Complete);
        assert!(a.content.contains("- QBR"));
    }

    #[tokio::test]
    async fn failing_and_slow_sources_degrade_without_aborting() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let acme = acme(&ws);
        let gen = generator(vec![
            Arc::new(Fixed("QBR")),
            Arc::new(Failing),
            Arc::new(Slow),
        ]);

        let artifact = gen.generate(&acme).await.unwrap();
        assert_eq!(
            artifact.status,
            GenerationStatus::Degraded {
                sections: vec!["open-items".to_string(), "slow".to_string()]
            }
        );
        assert!(artifact.content.contains("- QBR"));
        assert!(!artifact.content.contains("too late"));
    }

    #[tokio::test]
    async fn missing_canonical_propagates_not_found() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let ghost = ws.entity_ref(EntityType::Account, "Ghost").unwrap();
        let err = generator(vec![]).generate(&ghost).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn degrade_folds_parts() {
        let status = GenerationStatus::Complete.degrade(Vec::new());
        assert_eq!(status, GenerationStatus::Complete);
        let status = status.degrade(vec!["cache".to_string()]);
        assert!(status.is_degraded());
    }
}
