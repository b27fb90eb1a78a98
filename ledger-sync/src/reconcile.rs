//! Reconciliation: map outside edits of an artifact back into the canonical
//! narrative through the enrichment service.
//!
//! ## Flow
//!
//! 1. Load the canonical record and remember its revision.
//! 2. Diff the on-disk artifact against the last generated body, ignoring
//!    the marker and live sections.
//! 3. Ask the enricher (bounded by the enrichment timeout) for a narrative
//!    patch `{overview?, notes?, sections?: [{title, content}]}`.
//! 4. Apply the patch and save with the remembered revision as precondition.
//! 5. Reproject and regenerate.
//!
//! Any failure before step 4 completes leaves the canonical file untouched and
//! surfaces as [`SyncError::ReconciliationFailed`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ledger_core::{store, CanonicalRecord, EntityRef, NarrativeSection, Revision, Workspace};

use crate::diff::{artifact_edits, ArtifactEdits};
use crate::error::{blocking, SyncError};
use crate::live::{EnrichmentRequest, Enricher};
use crate::pipeline::{RegenerationReason, RegenerationReport, SyncEngine};
use crate::sync_state;
use crate::writer::read_artifact;

const INSTRUCTION: &str = "\
The user edited the generated dashboard for this entity by hand. \
Fold the edits shown in `edits` into the narrative shown in `narrative`. \
Reply with a JSON object containing only the parts that change: \
{\"overview\"?: string, \"notes\"?: string, \"sections\"?: [{\"title\": string, \"content\": string}]}. \
Sections are matched by title. Reply {} if nothing should change.";

/// Per-entity synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Clean,
    CanonicalExternallyModified,
    ArtifactExternallyModified,
    Reconciling,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityState::Clean => "clean",
            EntityState::CanonicalExternallyModified => "canonical_externally_modified",
            EntityState::ArtifactExternallyModified => "artifact_externally_modified",
            EntityState::Reconciling => "reconciling",
        };
        f.write_str(s)
    }
}

/// Narrative changes returned by the enricher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NarrativePatch {
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub sections: Option<Vec<NarrativeSection>>,
}

impl NarrativePatch {
    pub fn is_empty(&self) -> bool {
        self.overview.is_none() && self.notes.is_none() && self.sections.is_none()
    }
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Narrative parts the patch touched (`overview`, `notes`, `section:<title>`).
    pub applied: Vec<String>,
    /// Canonical revision after the save, or the untouched one when nothing applied.
    pub revision: Revision,
    pub regeneration: RegenerationReport,
}

/// Parse an enrichment response into a patch.
///
/// Accepts the object itself or a string holding it.
pub fn parse_patch(response: &Value) -> Result<NarrativePatch, String> {
    let value = match response {
        Value::String(text) => serde_json::from_str::<Value>(text.trim())
            .map_err(|e| format!("response text is not JSON: {e}"))?,
        other => other.clone(),
    };
    if !value.is_object() {
        return Err(format!("expected a JSON object, got {value}"));
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Apply `patch` to the record's narrative and stamp the enrichment times.
///
/// Sections replace by case-insensitive title or append when new.
pub fn apply_patch(record: &mut CanonicalRecord, patch: &NarrativePatch, at: DateTime<Utc>) -> Vec<String> {
    let mut applied = Vec::new();
    if let Some(overview) = &patch.overview {
        record.narrative.overview = Some(overview.clone());
        applied.push("overview".to_string());
    }
    if let Some(notes) = &patch.notes {
        record.narrative.notes = Some(notes.clone());
        applied.push("notes".to_string());
    }
    for section in patch.sections.iter().flatten() {
        match record.narrative.section_mut(&section.title) {
            Some(existing) => existing.content = section.content.clone(),
            None => record.narrative.sections.push(section.clone()),
        }
        applied.push(format!("section:{}", section.title));
    }
    for key in &applied {
        record.enrichment.insert(key.clone(), at);
    }
    applied
}

/// The request sent to the enricher.
pub fn build_request(entity: &EntityRef, record: &CanonicalRecord, edits: &ArtifactEdits) -> EnrichmentRequest {
    EnrichmentRequest {
        instruction: INSTRUCTION.to_string(),
        context: json!({
            "entity": {
                "id": entity.id,
                "type": entity.entity_type,
                "name": entity.name,
            },
            "narrative": record.narrative,
            "edits": {
                "diff": edits.unified_diff,
                "added": edits.added,
                "removed": edits.removed,
            },
        }),
    }
}

/// Run a reconciliation for `entity`.
pub async fn run(
    engine: &SyncEngine,
    entity: &EntityRef,
    enricher: &dyn Enricher,
) -> Result<ReconcileReport, SyncError> {
    let fail = |reason: String| SyncError::ReconciliationFailed {
        entity: entity.id.clone(),
        reason,
    };

    let workspace: Workspace = engine.workspace().clone();
    let owned = entity.clone();
    let (loaded, state, current) = blocking(move || {
        let loaded = store::load(&owned)?;
        let state = sync_state::load(&workspace, &owned.id);
        let current = read_artifact(&owned.artifact_path())?;
        Ok((loaded, state, current))
    })
    .await?;

    let base = state
        .generated_body
        .ok_or_else(|| fail("no generated artifact to compare against".to_string()))?;
    let current = current.ok_or_else(|| fail("artifact is missing".to_string()))?;

    let edits = artifact_edits(&base, &current);
    if edits.is_empty() {
        tracing::info!("reconcile {}: no edits outside live sections", entity.id);
        let regeneration = engine
            .regenerate(entity, RegenerationReason::Reconciled)
            .await?;
        return Ok(ReconcileReport {
            applied: Vec::new(),
            revision: loaded.revision,
            regeneration,
        });
    }

    let request = build_request(entity, &loaded.record, &edits);
    let timeout = engine.config().enrichment_timeout();
    let response = match tokio::time::timeout(timeout, enricher.enrich(request)).await {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => return Err(fail(format!("enrichment failed: {err:#}"))),
        Err(_) => return Err(fail(format!("enrichment timed out after {timeout:?}"))),
    };
    let patch = parse_patch(&response)
        .map_err(|e| fail(format!("unparseable enrichment response: {e}")))?;

    let mut record = loaded.record.clone();
    let applied = apply_patch(&mut record, &patch, Utc::now());
    let revision = if applied.is_empty() {
        loaded.revision.clone()
    } else {
        let owned = entity.clone();
        let expected = loaded.revision.clone();
        let saved = blocking(move || store::save(&owned, &record, Some(&expected)).map_err(SyncError::from))
            .await
            .map_err(|err| {
                if err.is_conflict() {
                    fail("canonical record changed during reconciliation".to_string())
                } else {
                    err
                }
            })?;
        saved.revision
    };

    let regeneration = engine
        .regenerate(entity, RegenerationReason::Reconciled)
        .await?;
    tracing::info!(
        "reconciled {}: applied [{}] at {}",
        entity.id,
        applied.join(", "),
        revision.short()
    );
    Ok(ReconcileReport {
        applied,
        revision,
        regeneration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledger_core::EntityType;

    fn record() -> CanonicalRecord {
        let mut record = CanonicalRecord::new(EntityType::Account);
        record.narrative.overview = Some("Old overview".to_string());
        record.narrative.sections.push(NarrativeSection {
            title: "Risks".to_string(),
            content: "None known.".to_string(),
        });
        record
    }

    #[test]
    fn parse_accepts_object_and_embedded_string() {
        let patch = parse_patch(&json!({"overview": "New"})).unwrap();
        assert_eq!(patch.overview.as_deref(), Some("New"));
        let patch = parse_patch(&json!("{\"notes\": \"n\"}")).unwrap();
        assert_eq!(patch.notes.as_deref(), Some("n"));
        assert!(parse_patch(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_other_shapes() {
        assert!(parse_patch(&json!(["overview"])).is_err());
        assert!(parse_patch(&json!("not json at all")).is_err());
        assert!(parse_patch(&json!({"overview": 3})).is_err());
        assert!(parse_patch(&json!({"structured": {"health": "red"}})).is_err());
    }

    #[test]
    fn apply_replaces_by_title_and_appends_new_sections() {
        let mut record = record();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let patch = NarrativePatch {
            overview: Some("New overview".to_string()),
            notes: None,
            sections: Some(vec![
                NarrativeSection {
                    title: "risks".to_string(),
                    content: "Champion leaving.".to_string(),
                },
                NarrativeSection {
                    title: "Wins".to_string(),
                    content: "Signed pilot.".to_string(),
                },
            ]),
        };

        let applied = apply_patch(&mut record, &patch, at);

        assert_eq!(applied, vec!["overview", "section:risks", "section:Wins"]);
        assert_eq!(record.narrative.overview.as_deref(), Some("New overview"));
        assert_eq!(record.narrative.sections.len(), 2);
        assert_eq!(record.narrative.sections[0].title, "Risks");
        assert_eq!(record.narrative.sections[0].content, "Champion leaving.");
        assert_eq!(record.narrative.sections[1].title, "Wins");
        assert_eq!(record.enrichment.get("overview"), Some(&at));
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut record = record();
        let before = record.clone();
        assert!(apply_patch(&mut record, &NarrativePatch::default(), Utc::now()).is_empty());
        assert_eq!(record, before);
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(EntityState::ArtifactExternallyModified).unwrap(),
            json!("artifact_externally_modified")
        );
        assert_eq!(EntityState::Reconciling.to_string(), "reconciling");
    }
}
