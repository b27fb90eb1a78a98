//! Workspace layout, entity discovery and creation.
//!
//! # Storage layout
//!
//! ```text
//! <workspace>/
//!   Accounts/
//!     <Name>/
//!       dashboard.json   (canonical record, authoritative)
//!       dashboard.md     (generated artifact)
//!   Projects/
//!     <Name>/…
//!   .ledger/
//!     config.yaml
//!     cache.db
//!     state/<entity>.json
//!     ledgerd.sock
//! ```

use std::path::{Component, Path, PathBuf};

use crate::error::{io_err, StoreError};
use crate::store;
use crate::types::{CanonicalRecord, EntityId, EntityRef, EntityType, FileKind};

/// A workspace root and the paths derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Path helpers (pure, no I/O)
    // -----------------------------------------------------------------------

    /// `<workspace>/.ledger/`
    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join(".ledger")
    }

    pub fn config_path(&self) -> PathBuf {
        self.ledger_dir().join("config.yaml")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.ledger_dir().join("cache.db")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.ledger_dir().join("state")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ledger_dir().join("ledgerd.sock")
    }

    /// `<workspace>/Accounts/` or `<workspace>/Projects/`
    pub fn type_dir(&self, entity_type: EntityType) -> PathBuf {
        self.root.join(entity_type.dir_name())
    }

    /// Build the reference for an entity named `name` of `entity_type`.
    ///
    /// The name must be a single path component that slugifies to a usable id.
    pub fn entity_ref(&self, entity_type: EntityType, name: &str) -> Result<EntityRef, StoreError> {
        let mut components = Path::new(name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let id = EntityId::from_name(name).ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        Ok(EntityRef {
            id,
            entity_type,
            name: name.to_string(),
            dir: self.type_dir(entity_type).join(name),
        })
    }

    /// Classify a path as one of an entity's two well-known files.
    pub fn resolve_path(&self, path: &Path) -> Option<(EntityRef, FileKind)> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = rel.components();
        let type_dir = parts.next()?.as_os_str().to_str()?;
        let name = parts.next()?.as_os_str().to_str()?;
        let file = parts.next()?.as_os_str().to_str()?;
        if parts.next().is_some() {
            return None;
        }
        let entity_type = EntityType::from_dir_name(type_dir)?;
        let kind = FileKind::from_file_name(file)?;
        let entity = self.entity_ref(entity_type, name).ok()?;
        Some((entity, kind))
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Every entity directory that holds a canonical file, sorted by type then id.
    pub fn list_entities(&self) -> Result<Vec<EntityRef>, StoreError> {
        let mut result = Vec::new();
        for entity_type in EntityType::all() {
            let dir = self.type_dir(*entity_type);
            if !dir.exists() {
                continue;
            }
            let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
            for entry in entries.filter_map(|e| e.ok()) {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let Ok(entity) = self.entity_ref(*entity_type, &name) else {
                    continue;
                };
                if entity.canonical_path().exists() {
                    result.push(entity);
                }
            }
        }
        result.sort_by(|a, b| {
            (a.entity_type, &a.id, &a.name).cmp(&(b.entity_type, &b.id, &b.name))
        });
        Ok(result)
    }

    /// Look an entity up by id. Accounts shadow projects with the same id.
    pub fn find_entity(&self, id: &EntityId) -> Result<EntityRef, StoreError> {
        self.list_entities()?
            .into_iter()
            .find(|e| &e.id == id)
            .ok_or_else(|| StoreError::NotFound {
                entity: id.clone(),
                path: self.root.clone(),
            })
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Establish an entity with an empty default record.
    ///
    /// Idempotent: an existing canonical file is left untouched.
    pub fn create_entity(&self, entity_type: EntityType, name: &str) -> Result<EntityRef, StoreError> {
        let entity = self.entity_ref(entity_type, name)?;
        if entity.canonical_path().exists() {
            return Ok(entity);
        }
        std::fs::create_dir_all(&entity.dir).map_err(|e| io_err(&entity.dir, e))?;
        store::save(&entity, &CanonicalRecord::new(entity_type), None)?;
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn create_entity_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let first = ws.create_entity(EntityType::Account, "Acme Corp").unwrap();
        assert_eq!(first.id.0, "acme-corp");
        assert!(first.canonical_path().exists());

        let mut loaded = store::load(&first).unwrap();
        loaded.record.set_field("health", "green");
        store::save(&first, &loaded.record, None).unwrap();

        let again = ws.create_entity(EntityType::Account, "Acme Corp").unwrap();
        assert_eq!(again, first);
        let reloaded = store::load(&again).unwrap();
        assert!(reloaded.record.field("health").is_some(), "must not reset record");
    }

    #[test]
    fn list_entities_is_sorted_and_skips_bare_dirs() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.create_entity(EntityType::Project, "Rollout").unwrap();
        ws.create_entity(EntityType::Account, "Zeta").unwrap();
        ws.create_entity(EntityType::Account, "Acme").unwrap();
        fs::create_dir_all(ws.type_dir(EntityType::Account).join("Empty")).unwrap();

        let ids: Vec<_> = ws
            .list_entities()
            .unwrap()
            .into_iter()
            .map(|e| (e.entity_type, e.id.0))
            .collect();
        assert_eq!(
            ids,
            vec![
                (EntityType::Account, "acme".to_string()),
                (EntityType::Account, "zeta".to_string()),
                (EntityType::Project, "rollout".to_string()),
            ]
        );
    }

    #[test]
    fn resolve_path_classifies_entity_files() {
        let ws = Workspace::new("/ws");
        let (entity, kind) = ws
            .resolve_path(Path::new("/ws/Accounts/Acme/dashboard.md"))
            .unwrap();
        assert_eq!(entity.id.0, "acme");
        assert_eq!(kind, FileKind::Artifact);

        let (_, kind) = ws
            .resolve_path(Path::new("/ws/Projects/Big Launch/dashboard.json"))
            .unwrap();
        assert_eq!(kind, FileKind::Canonical);

        assert!(ws.resolve_path(Path::new("/ws/Accounts/Acme/notes.md")).is_none());
        assert!(ws.resolve_path(Path::new("/ws/Other/Acme/dashboard.md")).is_none());
        assert!(ws.resolve_path(Path::new("/elsewhere/Accounts/Acme/dashboard.md")).is_none());
        assert!(ws
            .resolve_path(Path::new("/ws/Accounts/Acme/sub/dashboard.md"))
            .is_none());
    }

    #[test]
    fn entity_names_must_be_single_components() {
        let ws = Workspace::new("/ws");
        assert!(ws.entity_ref(EntityType::Account, "../escape").is_err());
        assert!(ws.entity_ref(EntityType::Account, "a/b").is_err());
        assert!(ws.entity_ref(EntityType::Account, "???").is_err());
    }

    #[test]
    fn find_entity_reports_missing_ids() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.create_entity(EntityType::Account, "Acme").unwrap();
        assert!(ws.find_entity(&EntityId::from("acme")).is_ok());
        assert!(ws
            .find_entity(&EntityId::from("globex"))
            .unwrap_err()
            .is_not_found());
    }
}
