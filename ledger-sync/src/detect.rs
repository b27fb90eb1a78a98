//! External-edit detection by mtime + content hash.
//!
//! A file counts as externally modified only when **both** hold:
//! its mtime is newer than the one the engine recorded, and its content
//! differs from what the engine recorded. A touch is not an edit, and neither
//! is a rewrite with identical bytes.
//!
//! Without sync state the canonical file is always treated as changed (it has
//! never been projected), and the artifact falls back to the `at=` timestamp
//! in its generation marker plus a small grace period.

use chrono::{DateTime, Duration, Utc};

use ledger_core::{store, EntityRef, Revision};
use ledger_renderer::marker::parse_marker;

use crate::error::SyncError;
use crate::sync_state::{to_utc, SyncState};
use crate::writer::{artifact_hash, read_artifact};

/// Allowed gap, in seconds, between the marker timestamp and the write that
/// carried it.
pub const MARKER_GRACE_SECS: i64 = 2;

/// What a pull check found for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Nothing changed since the engine's last write.
    Clean,
    /// The canonical record changed (or was never synced). When the artifact
    /// was edited too, `artifact_edited` is set; the canonical change wins.
    CanonicalChanged {
        revision: Revision,
        artifact_edited: bool,
    },
    /// Only the artifact changed outside the engine.
    ArtifactEdited,
    /// The artifact is missing; regenerate without a warning.
    ArtifactMissing,
    /// The canonical file is gone.
    CanonicalMissing,
}

impl Observation {
    /// `true` when a plain regeneration is the right response.
    pub fn needs_regeneration(&self) -> bool {
        matches!(
            self,
            Observation::CanonicalChanged { .. } | Observation::ArtifactMissing
        )
    }
}

/// Compare the entity's files against the recorded sync state.
pub fn check(entity: &EntityRef, state: &SyncState) -> Result<Observation, SyncError> {
    let Some(revision) = store::current_revision(entity)? else {
        return Ok(Observation::CanonicalMissing);
    };
    let canonical_mtime = to_utc(store::modified_at(&entity.canonical_path())?);
    let canonical_changed = canonical_changed(state, &revision, canonical_mtime);
    let artifact = artifact_status(entity, state)?;

    Ok(match (canonical_changed, artifact) {
        (true, ArtifactStatus::Edited) => Observation::CanonicalChanged {
            revision,
            artifact_edited: true,
        },
        (true, _) => Observation::CanonicalChanged {
            revision,
            artifact_edited: false,
        },
        (false, ArtifactStatus::Edited) => Observation::ArtifactEdited,
        (false, ArtifactStatus::Missing) => Observation::ArtifactMissing,
        (false, ArtifactStatus::Unchanged) => Observation::Clean,
    })
}

/// `true` when the artifact on disk carries edits the engine did not write.
pub fn artifact_edited(entity: &EntityRef, state: &SyncState) -> Result<bool, SyncError> {
    Ok(artifact_status(entity, state)? == ArtifactStatus::Edited)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactStatus {
    Unchanged,
    Edited,
    Missing,
}

fn canonical_changed(state: &SyncState, revision: &Revision, mtime: DateTime<Utc>) -> bool {
    match (&state.canonical_revision, state.canonical_mtime) {
        (Some(recorded), Some(recorded_mtime)) => mtime > recorded_mtime && recorded != revision,
        _ => true,
    }
}

fn artifact_status(entity: &EntityRef, state: &SyncState) -> Result<ArtifactStatus, SyncError> {
    let path = entity.artifact_path();
    let Some(content) = read_artifact(&path)? else {
        return Ok(ArtifactStatus::Missing);
    };
    let mtime = to_utc(store::modified_at(&path)?);

    let edited = match (&state.artifact_hash, state.artifact_mtime) {
        (Some(hash), Some(recorded_mtime)) => {
            mtime > recorded_mtime && artifact_hash(&content) != *hash
        }
        _ => match parse_marker(&content) {
            Some(marker) => mtime > marker.generated_at + Duration::seconds(MARKER_GRACE_SECS),
            // Never generated by the engine: nothing to protect.
            None => false,
        },
    };
    Ok(if edited {
        ArtifactStatus::Edited
    } else {
        ArtifactStatus::Unchanged
    })
}
