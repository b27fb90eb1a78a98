//! Sync state: the engine's memory of what it last wrote for each entity.
//!
//! Persists a [`SyncState`] JSON document at
//! `<workspace>/.ledger/state/<entity_id>.json`, written with the same
//! tmp + rename pattern as the canonical store. A missing or unreadable file
//! means "never synced".

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::{store, EntityId, Revision, Workspace};

use crate::error::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Canonical revision last written or accepted by the engine.
    #[serde(default)]
    pub canonical_revision: Option<Revision>,
    /// Canonical mtime observed at that point.
    #[serde(default)]
    pub canonical_mtime: Option<DateTime<Utc>>,
    /// Content hash of the artifact the engine last wrote.
    #[serde(default)]
    pub artifact_hash: Option<String>,
    #[serde(default)]
    pub artifact_mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    /// Last generated artifact body (marker line excluded). Reconciliation base.
    #[serde(default)]
    pub generated_body: Option<String>,
}

impl SyncState {
    pub fn never_synced(&self) -> bool {
        self.canonical_revision.is_none()
    }
}

/// `<workspace>/.ledger/state/<entity_id>.json`
pub fn state_path(workspace: &Workspace, id: &EntityId) -> PathBuf {
    workspace.state_dir().join(format!("{id}.json"))
}

/// Load the sync state for `id`, defaulting when absent or unreadable.
pub fn load(workspace: &Workspace, id: &EntityId) -> SyncState {
    let path = state_path(workspace, id);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return SyncState::default(),
        Err(err) => {
            tracing::warn!("ignoring unreadable sync state {}: {err}", path.display());
            return SyncState::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!("ignoring malformed sync state {}: {err}", path.display());
            SyncState::default()
        }
    }
}

/// Save the sync state for `id` atomically.
pub fn save(workspace: &Workspace, id: &EntityId, state: &SyncState) -> Result<(), SyncError> {
    let path = state_path(workspace, id);
    let json = serde_json::to_string_pretty(state)?;
    store::write_atomic(&path, &json)?;
    Ok(())
}

/// Filesystem timestamps are stored as UTC instants.
pub fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample() -> SyncState {
        SyncState {
            canonical_revision: Some(Revision::of("{}")),
            canonical_mtime: Some(Utc::now()),
            artifact_hash: Some("cafebabe".to_string()),
            artifact_mtime: Some(Utc::now()),
            generated_at: Some(Utc::now()),
            generated_body: Some("# Acme\n".to_string()),
        }
    }

    #[test]
    fn empty_state_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let state = load(&Workspace::new(tmp.path()), &EntityId::from("acme"));
        assert!(state.never_synced());
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let id = EntityId::from("acme");
        let state = sample();
        save(&ws, &id, &state).unwrap();
        // Sub-second timestamps survive exactly.
        assert_eq!(load(&ws, &id), state);
        assert!(!store::tmp_path(&state_path(&ws, &id)).exists());
    }

    #[test]
    fn malformed_state_degrades_to_never_synced() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let id = EntityId::from("acme");
        fs::create_dir_all(ws.state_dir()).unwrap();
        fs::write(state_path(&ws, &id), "{ nope").unwrap();
        assert!(load(&ws, &id).never_synced());
    }
}
