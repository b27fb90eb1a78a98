//! Cache projector: mirrors each entity's structured fields into SQLite.
//!
//! The cache is disposable: deleting `cache.db` and calling
//! [`CacheProjector::rebuild_all`] reconstructs it from the canonical files.
//!
//! # Tables
//!
//! ```text
//! entities(entity_id PK, entity_type, name, last_synced_version, projected_at)
//! entity_fields(entity_id FK, field, value_json, value_text, PK(entity_id, field))
//! ```
//!
//! Every operation opens its own connection. Writes run in IMMEDIATE
//! transactions so concurrent writers queue on `busy_timeout` instead of
//! failing mid-transaction; WAL lets readers see either the old or the new
//! state, never a mix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use ledger_core::{
    store, CanonicalRecord, EntityId, EntityRef, EntityType, FieldValue, Loaded, Revision,
    Workspace,
};

use crate::error::{io_err, SyncError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_id           TEXT PRIMARY KEY,
    entity_type         TEXT NOT NULL,
    name                TEXT NOT NULL,
    last_synced_version TEXT NOT NULL,
    projected_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS entity_fields (
    entity_id  TEXT NOT NULL REFERENCES entities(entity_id) ON DELETE CASCADE,
    field      TEXT NOT NULL,
    value_json TEXT NOT NULL,
    value_text TEXT,
    PRIMARY KEY (entity_id, field)
);
CREATE INDEX IF NOT EXISTS idx_entity_fields_field ON entity_fields(field, value_text);
";

/// The cached projection of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub name: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Revision of the canonical record this row was projected from.
    pub last_synced_version: Revision,
}

/// Outcome of [`CacheProjector::rebuild_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub projected: usize,
    /// Entities whose canonical record could not be loaded, with the reason.
    pub skipped: Vec<(EntityId, String)>,
}

/// Handle on the SQLite cache. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CacheProjector {
    db_path: PathBuf,
}

impl CacheProjector {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// `<workspace>/.ledger/cache.db`
    pub fn for_workspace(workspace: &Workspace) -> Self {
        Self::new(workspace.cache_db_path())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection, SyncError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Upsert the entity row and replace its fields, all-or-nothing.
    pub fn project(
        &self,
        entity: &EntityRef,
        record: &CanonicalRecord,
        revision: &Revision,
    ) -> Result<(), SyncError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        write_entity(&tx, entity, record, revision)?;
        tx.commit()?;
        tracing::debug!("projected {} at {}", entity.id, revision.short());
        Ok(())
    }

    /// Replace the whole cache with a projection of every canonical record.
    ///
    /// All records are loaded before the transaction starts, so a slow or
    /// corrupt file never holds the write lock. Corrupt records are skipped and
    /// reported.
    pub fn rebuild_all(&self, workspace: &Workspace) -> Result<RebuildReport, SyncError> {
        let mut report = RebuildReport::default();
        let mut loaded = Vec::new();
        for entity in workspace.list_entities()? {
            match store::load(&entity) {
                Ok(l) => loaded.push((entity, l)),
                Err(err) => {
                    tracing::warn!("skipping {} during cache rebuild: {err}", entity.id);
                    report.skipped.push((entity.id.clone(), err.to_string()));
                }
            }
        }
        self.replace_all(loaded, report)
    }

    /// Second half of [`rebuild_all`](Self::rebuild_all).
    ///
    /// A save may have been projected between the preload and the write lock.
    /// Each snapshot is checked against the on-disk revision under the lock and
    /// reloaded when it is stale; later projections queue behind this
    /// transaction and land after it.
    fn replace_all(
        &self,
        loaded: Vec<(EntityRef, Loaded)>,
        mut report: RebuildReport,
    ) -> Result<RebuildReport, SyncError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM entity_fields", [])?;
        tx.execute("DELETE FROM entities", [])?;
        for (entity, snapshot) in loaded {
            let current = match store::current_revision(&entity) {
                Ok(Some(revision)) if revision == snapshot.revision => Ok(snapshot),
                Ok(Some(_)) => {
                    tracing::debug!("{} changed during cache rebuild; reloading", entity.id);
                    store::load(&entity).map_err(|err| err.to_string())
                }
                Ok(None) => Err("canonical record removed during cache rebuild".to_string()),
                Err(err) => Err(err.to_string()),
            };
            let current = match current {
                Ok(current) => current,
                Err(reason) => {
                    tracing::warn!("skipping {} during cache rebuild: {reason}", entity.id);
                    report.skipped.push((entity.id.clone(), reason));
                    continue;
                }
            };
            write_entity(&tx, &entity, &current.record, &current.revision)?;
            report.projected += 1;
        }
        tx.commit()?;

        tracing::info!(
            "cache rebuilt: {} projected, {} skipped",
            report.projected,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Cached row for `id`, if projected.
    pub fn row(&self, id: &EntityId) -> Result<Option<CacheRow>, SyncError> {
        let conn = self.open()?;
        let head = conn
            .query_row(
                "SELECT entity_id, entity_type, name, last_synced_version
                 FROM entities WHERE entity_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match head {
            Some(head) => Ok(Some(assemble(&conn, head)?)),
            None => Ok(None),
        }
    }

    /// Every cached row, ordered by entity id.
    pub fn rows(&self) -> Result<Vec<CacheRow>, SyncError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_type, name, last_synced_version
             FROM entities ORDER BY entity_id",
        )?;
        let heads = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<(String, String, String, String)>, _>>()?;
        heads.into_iter().map(|h| assemble(&conn, h)).collect()
    }
}

fn write_entity(
    tx: &Transaction<'_>,
    entity: &EntityRef,
    record: &CanonicalRecord,
    revision: &Revision,
) -> Result<(), SyncError> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    tx.execute(
        "INSERT INTO entities (entity_id, entity_type, name, last_synced_version, projected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(entity_id) DO UPDATE SET
             entity_type = excluded.entity_type,
             name = excluded.name,
             last_synced_version = excluded.last_synced_version,
             projected_at = excluded.projected_at",
        params![
            entity.id.as_str(),
            entity.entity_type.to_string(),
            entity.name,
            revision.0,
            now
        ],
    )?;
    tx.execute(
        "DELETE FROM entity_fields WHERE entity_id = ?1",
        params![entity.id.as_str()],
    )?;
    let mut insert = tx.prepare(
        "INSERT INTO entity_fields (entity_id, field, value_json, value_text)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (field, value) in &record.structured {
        let text = match value {
            FieldValue::Null => None,
            other => Some(other.to_string()),
        };
        insert.execute(params![
            entity.id.as_str(),
            field,
            serde_json::to_string(value)?,
            text
        ])?;
    }
    Ok(())
}

fn assemble(
    conn: &Connection,
    (id, entity_type, name, version): (String, String, String, String),
) -> Result<CacheRow, SyncError> {
    let entity_type: EntityType = serde_json::from_value(serde_json::Value::String(entity_type))?;
    let mut stmt = conn.prepare(
        "SELECT field, value_json FROM entity_fields WHERE entity_id = ?1 ORDER BY field",
    )?;
    let pairs = stmt
        .query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut fields = BTreeMap::new();
    for (field, json) in pairs {
        fields.insert(field, serde_json::from_str(&json)?);
    }
    Ok(CacheRow {
        entity_id: EntityId(id),
        entity_type,
        name,
        fields,
        last_synced_version: Revision(version),
    })
}
