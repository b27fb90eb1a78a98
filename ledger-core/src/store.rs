//! Canonical store: atomic load / save of `dashboard.json`.
//!
//! # Write flow
//!
//! 1. Serialize the record at the current schema version.
//! 2. Read the on-disk file (if any): refuse to overwrite a newer schema, and
//!    compare its [`Revision`] with the caller's expected revision.
//! 3. Write `dashboard.json.ledger.tmp` in the same directory.
//! 4. Rename over `dashboard.json` (atomic on POSIX; readers never see a
//!    partial file). The tmp file is removed if the rename fails.
//!
//! The revision check in step 2 is the only optimistic-concurrency guard in
//! the engine and applies to every writer alike.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;

use crate::error::{corrupt, io_err, StoreError};
use crate::migrate::{self, CURRENT_SCHEMA_VERSION};
use crate::types::{CanonicalRecord, EntityRef, Revision};

/// A canonical record together with what was observed on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub record: CanonicalRecord,
    pub revision: Revision,
    pub modified: SystemTime,
    /// Set when the file was stored at an older schema version.
    pub migrated_from: Option<u32>,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saved {
    pub revision: Revision,
    pub modified: SystemTime,
}

/// Load and migrate the canonical record of `entity`.
pub fn load(entity: &EntityRef) -> Result<Loaded, StoreError> {
    let path = entity.canonical_path();
    // Stat before reading: a rename landing in between then shows up as an
    // mtime newer than the one returned here.
    let not_found = || StoreError::NotFound {
        entity: entity.id.clone(),
        path: path.clone(),
    };
    let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(err) => return Err(io_err(&path, err)),
    };
    let Some(contents) = read_optional(&path)? else {
        return Err(not_found());
    };
    let (record, migrated_from) = parse(&path, &contents)?;
    if record.entity_type != entity.entity_type {
        return Err(corrupt(
            &path,
            format!(
                "entityType '{}' does not match directory type '{}'",
                record.entity_type, entity.entity_type
            ),
        ));
    }
    Ok(Loaded {
        record,
        revision: Revision::of(&contents),
        modified,
        migrated_from,
    })
}

/// Parse raw canonical JSON, migrating older schema versions forward.
///
/// Returns the record and, if migration happened, the version it came from.
pub fn parse(path: &Path, contents: &str) -> Result<(CanonicalRecord, Option<u32>), StoreError> {
    let raw: Value = serde_json::from_str(contents)
        .map_err(|e| corrupt(path, format!("invalid JSON: {e}")))?;
    let (migrated, from) = migrate::migrate(raw).map_err(|e| corrupt(path, e.to_string()))?;
    let record: CanonicalRecord = serde_json::from_value(migrated)
        .map_err(|e| corrupt(path, format!("schema mismatch: {e}")))?;
    let migrated_from = (from < CURRENT_SCHEMA_VERSION).then_some(from);
    Ok((record, migrated_from))
}

/// Current on-disk revision of the canonical file, `None` if absent.
pub fn current_revision(entity: &EntityRef) -> Result<Option<Revision>, StoreError> {
    let path = entity.canonical_path();
    Ok(read_optional(&path)?.map(|contents| Revision::of(&contents)))
}

/// Atomically save `record` for `entity`.
///
/// With `expected = Some(rev)`, the save fails with [`StoreError::Conflict`]
/// when the file on disk no longer has revision `rev`, and with
/// [`StoreError::NotFound`] when the file has disappeared.
pub fn save(
    entity: &EntityRef,
    record: &CanonicalRecord,
    expected: Option<&Revision>,
) -> Result<Saved, StoreError> {
    let path = entity.canonical_path();
    let mut record = record.clone();
    record.version = CURRENT_SCHEMA_VERSION;
    record.entity_type = entity.entity_type;
    let mut json = serde_json::to_string_pretty(&record)?;
    json.push('\n');

    match read_optional(&path)? {
        Some(existing) => {
            if let Ok(raw) = serde_json::from_str::<Value>(&existing) {
                if let Ok(v) = migrate::schema_version(&raw) {
                    if v > CURRENT_SCHEMA_VERSION {
                        return Err(corrupt(
                            &path,
                            format!("refusing to overwrite record written by schema version {v}"),
                        ));
                    }
                }
            }
            if let Some(expected) = expected {
                let actual = Revision::of(&existing);
                if &actual != expected {
                    return Err(StoreError::Conflict {
                        path: path.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        None if expected.is_some() => {
            return Err(StoreError::NotFound {
                entity: entity.id.clone(),
                path,
            });
        }
        None => {}
    }

    let modified = write_atomic(&path, &json)?;
    Ok(Saved {
        revision: Revision::of(&json),
        modified,
    })
}

/// Write `contents` to `path` via a sibling `.ledger.tmp` file and a rename.
///
/// Parent directories are created as needed. Returns the mtime of the
/// written file, taken from the tmp file before the rename so a later writer
/// can never lend its mtime to these contents.
pub fn write_atomic(path: &Path, contents: &str) -> Result<SystemTime, StoreError> {
    write_atomic_with_tmp(path, contents, &tmp_path(path))
}

fn write_atomic_with_tmp(
    path: &Path,
    contents: &str,
    tmp: &Path,
) -> Result<SystemTime, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::write(tmp, contents).map_err(|e| io_err(tmp, e))?;
    let modified = match modified_at(tmp) {
        Ok(modified) => modified,
        Err(err) => {
            let _ = std::fs::remove_file(tmp);
            return Err(err);
        }
    };
    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }
    Ok(modified)
}

/// `<path>.ledger.tmp`, always a sibling so the rename never crosses filesystems.
pub fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.ledger.tmp", path.display()))
}

/// Modification time of `path`.
pub fn modified_at(path: &Path) -> Result<SystemTime, StoreError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| io_err(path, e))
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}
