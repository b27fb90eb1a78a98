//! Domain types for the entity ledger.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! The canonical record serializes as camelCase JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::migrate::CURRENT_SCHEMA_VERSION;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable entity identifier, derived from the entity's directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    /// Slugify a directory name into an id: lowercase ASCII alphanumerics,
    /// every other run of characters collapsed to a single `-`.
    ///
    /// Returns `None` when nothing usable remains.
    pub fn from_name(name: &str) -> Option<Self> {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(ch.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
        if slug.is_empty() {
            None
        } else {
            Some(Self(slug))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// SHA-256 hex digest of a canonical file's bytes (CRLF normalised to LF).
///
/// Used as the optimistic-concurrency token and as the cache's
/// `lastSyncedVersion` marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    /// Digest `content` the same way the store digests files on disk.
    pub fn of(content: &str) -> Self {
        let normalized = content.replace("\r\n", "\n");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// First 12 hex characters, for log lines and artifact headers.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of tracked entity. Fixed for the entity's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Account,
    Project,
}

impl EntityType {
    /// All entity types in a stable order.
    pub fn all() -> &'static [EntityType] {
        &[EntityType::Account, EntityType::Project]
    }

    /// Workspace directory that holds entities of this type.
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityType::Account => "Accounts",
            EntityType::Project => "Projects",
        }
    }

    /// Inverse of [`EntityType::dir_name`].
    pub fn from_dir_name(name: &str) -> Option<Self> {
        EntityType::all()
            .iter()
            .copied()
            .find(|t| t.dir_name() == name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Account => write!(f, "account"),
            EntityType::Project => write!(f, "project"),
        }
    }
}

/// Which of an entity's two well-known files a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Canonical,
    Artifact,
}

impl FileKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            FileKind::Canonical => "dashboard.json",
            FileKind::Artifact => "dashboard.md",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "dashboard.json" => Some(FileKind::Canonical),
            "dashboard.md" => Some(FileKind::Artifact),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Canonical => write!(f, "canonical"),
            FileKind::Artifact => write!(f, "artifact"),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity reference
// ---------------------------------------------------------------------------

/// Where an entity lives: id, type, display name and owning directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Directory name as it appears on disk (e.g. `Acme Corp`).
    pub name: String,
    /// Absolute path to the entity directory.
    pub dir: PathBuf,
}

impl EntityRef {
    pub fn canonical_path(&self) -> PathBuf {
        self.dir.join(FileKind::Canonical.file_name())
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(FileKind::Artifact.file_name())
    }

    pub fn path_for(&self, kind: FileKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// A structured field value. Dates and enums travel as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret a text value as an ISO `YYYY-MM-DD` date.
    pub fn as_date(&self) -> Option<NaiveDate> {
        self.as_text()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => b.fmt(f),
            FieldValue::Integer(i) => i.fmt(f),
            FieldValue::Float(x) => x.fmt(f),
            FieldValue::Text(s) => s.fmt(f),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// A titled, free-form narrative section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeSection {
    pub title: String,
    pub content: String,
}

/// Human / AI authored narrative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub sections: Vec<NarrativeSection>,
}

impl Narrative {
    /// Find a custom section by title, case-insensitively.
    pub fn section_mut(&mut self, title: &str) -> Option<&mut NarrativeSection> {
        self.sections
            .iter_mut()
            .find(|s| s.title.eq_ignore_ascii_case(title))
    }
}

/// The authoritative structured + narrative record of one entity.
///
/// Unknown top-level keys land in `extra` and are written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub version: u32,
    pub entity_type: EntityType,
    #[serde(default)]
    pub structured: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub narrative: Narrative,
    /// Enriched section key → last AI refresh.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enrichment: BTreeMap<String, DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalRecord {
    /// An empty record at the current schema version.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            entity_type,
            structured: BTreeMap::new(),
            narrative: Narrative::default(),
            enrichment: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.structured.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.structured.insert(name.into(), value.into());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
