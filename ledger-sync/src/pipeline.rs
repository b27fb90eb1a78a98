//! Shared sync pipeline used by the daemon's orchestrator.
//!
//! [`SyncEngine`] bundles the workspace, configuration, cache projector and
//! generator, and exposes one method per engine operation. It holds no
//! per-entity state; serializing runs per entity is the caller's job.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::{store, EngineConfig, EntityId, EntityRef, Loaded, Revision, Workspace};
use ledger_renderer::marker::strip_marker;
use ledger_renderer::Renderer;

use crate::cache::{CacheProjector, CacheRow, RebuildReport};
use crate::detect::{self, Observation};
use crate::diff;
use crate::error::{blocking, SyncError};
use crate::generator::{GenerationStatus, Generator};
use crate::live::{CacheSignals, Enricher, SharedLiveSource};
use crate::reconcile::{self, ReconcileReport};
use crate::sync_state::{self, to_utc, SyncState};
use crate::writer::{self, WriteResult};

/// Why a regeneration was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegenerationReason {
    /// The application changed the canonical record.
    Requested,
    /// The canonical file changed outside the engine.
    CanonicalChanged,
    /// The artifact disappeared.
    ArtifactMissing,
    /// A reconciliation saved new narrative.
    Reconciled,
    /// First sight of an entity with no sync state.
    Initial,
}

impl fmt::Display for RegenerationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegenerationReason::Requested => "requested",
            RegenerationReason::CanonicalChanged => "canonical-changed",
            RegenerationReason::ArtifactMissing => "artifact-missing",
            RegenerationReason::Reconciled => "reconciled",
            RegenerationReason::Initial => "initial",
        };
        f.write_str(s)
    }
}

/// Outcome of one regeneration run.
#[derive(Debug, Clone)]
pub struct RegenerationReport {
    pub entity: EntityId,
    pub reason: RegenerationReason,
    pub revision: Revision,
    pub generated_at: DateTime<Utc>,
    pub write: WriteResult,
    pub status: GenerationStatus,
    /// The artifact carried edits the engine did not write, and they are gone.
    pub overwrote_external_edit: bool,
}

/// All engine operations over one workspace. Cheap to share behind an `Arc`.
pub struct SyncEngine {
    workspace: Workspace,
    config: EngineConfig,
    cache: CacheProjector,
    generator: Generator,
}

impl SyncEngine {
    /// Build an engine with the given extra live sources. The built-in
    /// [`CacheSignals`] source is always appended, and templates under
    /// `<workspace>/.ledger/templates/` override the embedded ones.
    pub fn new(
        workspace: Workspace,
        config: EngineConfig,
        mut sources: Vec<SharedLiveSource>,
    ) -> Result<Self, SyncError> {
        let cache = CacheProjector::for_workspace(&workspace);
        let renderer = Renderer::with_overrides(&workspace.ledger_dir().join("templates"))?;
        sources.push(Arc::new(CacheSignals::new(
            cache.clone(),
            config.renewal_window_days,
        )));
        let generator = Generator::new(renderer, sources, config.live_query_timeout());
        Ok(Self {
            workspace,
            config,
            cache,
            generator,
        })
    }

    /// Engine with the workspace's `config.yaml` and no extra live sources.
    pub fn open(workspace: Workspace) -> Result<Self, SyncError> {
        let config = EngineConfig::load(&workspace)?;
        Self::new(workspace, config, Vec::new())
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheProjector {
        &self.cache
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Resolve an entity id against the workspace.
    pub async fn entity(&self, id: &EntityId) -> Result<EntityRef, SyncError> {
        let workspace = self.workspace.clone();
        let id = id.clone();
        blocking(move || workspace.find_entity(&id).map_err(SyncError::from)).await
    }

    /// Every entity in the workspace.
    pub async fn entities(&self) -> Result<Vec<EntityRef>, SyncError> {
        let workspace = self.workspace.clone();
        blocking(move || workspace.list_entities().map_err(SyncError::from)).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Load the canonical record. Never regenerates.
    pub async fn record(&self, entity: &EntityRef) -> Result<Loaded, SyncError> {
        let owned = entity.clone();
        blocking(move || store::load(&owned).map_err(SyncError::from)).await
    }

    pub async fn cache_row(&self, id: &EntityId) -> Result<Option<CacheRow>, SyncError> {
        let cache = self.cache.clone();
        let id = id.clone();
        blocking(move || cache.row(&id)).await
    }

    pub async fn cache_rows(&self) -> Result<Vec<CacheRow>, SyncError> {
        let cache = self.cache.clone();
        blocking(move || cache.rows()).await
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Pull-check the entity's files against the recorded sync state.
    pub async fn check(&self, entity: &EntityRef) -> Result<Observation, SyncError> {
        let workspace = self.workspace.clone();
        let owned = entity.clone();
        blocking(move || {
            let state = sync_state::load(&workspace, &owned.id);
            detect::check(&owned, &state)
        })
        .await
    }

    /// What the engine last recorded for the entity.
    pub async fn sync_state(&self, entity: &EntityRef) -> Result<SyncState, SyncError> {
        let workspace = self.workspace.clone();
        let id = entity.id.clone();
        blocking(move || Ok(sync_state::load(&workspace, &id))).await
    }

    /// Load, project, render and write one entity's artifact.
    ///
    /// Canonical load failures propagate. A failed projection only degrades
    /// the status; it is retried on the next run.
    pub async fn regenerate(
        &self,
        entity: &EntityRef,
        reason: RegenerationReason,
    ) -> Result<RegenerationReport, SyncError> {
        let loaded = self.record(entity).await?;

        let projection = {
            let cache = self.cache.clone();
            let owned = entity.clone();
            let record = loaded.record.clone();
            let revision = loaded.revision.clone();
            blocking(move || cache.project(&owned, &record, &revision)).await
        };
        let projection_failed = match projection {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!("cache projection for {} failed: {err}", entity.id);
                true
            }
        };

        let artifact = self.generator.generate_from(entity, &loaded).await?;
        let status = artifact
            .status
            .degrade(projection_failed.then(|| "cache".to_string()));
        let generated_at = artifact.generated_at;

        let workspace = self.workspace.clone();
        let owned = entity.clone();
        let content = artifact.content;
        let revision = loaded.revision.clone();
        let canonical_mtime = loaded.modified;
        let (write, overwrote) = blocking(move || {
            let mut state = sync_state::load(&workspace, &owned.id);
            let path = owned.artifact_path();
            let overwrote = detect::artifact_edited(&owned, &state)?;
            if overwrote {
                tracing::warn!(
                    "overwriting external edits to {} ({reason}); they were not reconciled",
                    path.display()
                );
            }
            let write = writer::write_artifact(&path, &content)?;

            state.canonical_revision = Some(revision);
            state.canonical_mtime = Some(to_utc(canonical_mtime));
            state.artifact_hash = Some(write.hash().to_string());
            state.artifact_mtime = Some(to_utc(write.modified()));
            if write.was_written() || state.generated_at.is_none() {
                state.generated_at = Some(generated_at);
            }
            state.generated_body = Some(strip_marker(&content).to_string());
            sync_state::save(&workspace, &owned.id, &state)?;
            Ok((write, overwrote))
        })
        .await?;

        if status.is_degraded() {
            tracing::warn!("generated {} degraded: {status:?}", entity.id);
        } else {
            tracing::debug!("generated {} ({reason})", entity.id);
        }

        Ok(RegenerationReport {
            entity: entity.id.clone(),
            reason,
            revision: loaded.revision,
            generated_at,
            write,
            status,
            overwrote_external_edit: overwrote,
        })
    }

    /// Map outside artifact edits back into the canonical narrative.
    pub async fn reconcile(
        &self,
        entity: &EntityRef,
        enricher: &dyn Enricher,
    ) -> Result<ReconcileReport, SyncError> {
        reconcile::run(self, entity, enricher).await
    }

    /// Drop and rebuild the cache from every canonical record.
    pub async fn rebuild_cache(&self) -> Result<RebuildReport, SyncError> {
        let cache = self.cache.clone();
        let workspace = self.workspace.clone();
        blocking(move || cache.rebuild_all(&workspace)).await
    }

    /// Unified diff between the artifact on disk and a fresh render.
    pub async fn preview(&self, entity: &EntityRef) -> Result<Option<String>, SyncError> {
        diff::preview(&self.generator, entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{CanonicalRecord, EntityType};
    use ledger_renderer::marker::parse_marker;
    use std::fs;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> SyncEngine {
        SyncEngine::open(Workspace::new(tmp.path())).unwrap()
    }

    #[tokio::test]
    async fn regenerate_writes_artifact_cache_and_state() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let acme = engine
            .workspace()
            .create_entity(EntityType::Account, "Acme")
            .unwrap();

        let report = engine
            .regenerate(&acme, RegenerationReason::Initial)
            .await
            .unwrap();

        assert!(report.write.was_written());
        assert!(!report.overwrote_external_edit);
        let doc = fs::read_to_string(acme.artifact_path()).unwrap();
        assert_eq!(parse_marker(&doc).unwrap().revision, report.revision);
        let row = engine.cache_row(&acme.id).await.unwrap().unwrap();
        assert_eq!(row.last_synced_version, report.revision);
        assert_eq!(
            engine.check(&acme).await.unwrap(),
            Observation::Clean
        );
    }

    #[tokio::test]
    async fn unchanged_regeneration_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let acme = engine
            .workspace()
            .create_entity(EntityType::Account, "Acme")
            .unwrap();
        engine
            .regenerate(&acme, RegenerationReason::Initial)
            .await
            .unwrap();
        let before = fs::read_to_string(acme.artifact_path()).unwrap();

        let report = engine
            .regenerate(&acme, RegenerationReason::Requested)
            .await
            .unwrap();
        assert!(!report.write.was_written());
        assert_eq!(fs::read_to_string(acme.artifact_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn corrupt_canonical_propagates() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let acme = engine
            .workspace()
            .create_entity(EntityType::Account, "Acme")
            .unwrap();
        fs::write(acme.canonical_path(), "{").unwrap();
        let err = engine
            .regenerate(&acme, RegenerationReason::Requested)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(ledger_core::StoreError::Corrupt { .. })
        ));
        assert!(!acme.artifact_path().exists());
    }

    #[tokio::test]
    async fn preview_reports_pending_changes_without_writing() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let acme = engine
            .workspace()
            .create_entity(EntityType::Account, "Acme")
            .unwrap();
        engine
            .regenerate(&acme, RegenerationReason::Initial)
            .await
            .unwrap();
        assert!(engine.preview(&acme).await.unwrap().is_none());

        let mut record = CanonicalRecord::new(EntityType::Account);
        record.narrative.overview = Some("Now with an overview.".to_string());
        store::save(&acme, &record, None).unwrap();
        let before = fs::read_to_string(acme.artifact_path()).unwrap();

        let diff = engine.preview(&acme).await.unwrap().expect("diff");
        assert!(diff.contains("+Now with an overview."));
        assert_eq!(fs::read_to_string(acme.artifact_path()).unwrap(), before);
    }

    #[test]
    fn reason_display_matches_serde() {
        assert_eq!(
            serde_json::to_value(RegenerationReason::CanonicalChanged).unwrap(),
            serde_json::json!(RegenerationReason::CanonicalChanged.to_string())
        );
    }
}
