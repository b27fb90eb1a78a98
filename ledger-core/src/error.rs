//! Error types for ledger-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EntityId, Revision};

/// All errors that can arise from canonical store and workspace operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The entity has no canonical file. Creating one is the caller's job.
    #[error("no canonical record for '{entity}' at {path}")]
    NotFound { entity: EntityId, path: PathBuf },

    /// The canonical file is unparseable, unmigrateable, or written by a newer
    /// schema. Surfaced as-is, never auto-repaired.
    #[error("corrupt canonical record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Optimistic-concurrency precondition failed on save.
    #[error("canonical record at {path} changed on disk (expected revision {expected}, found {actual})")]
    Conflict {
        path: PathBuf,
        expected: Revision,
        actual: Revision,
    },

    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed `config.yaml`.
    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An entity name that cannot be turned into a directory or id.
    #[error("invalid entity name '{0}'")]
    InvalidName(String),
}

impl StoreError {
    /// `true` for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`StoreError::Corrupt`].
pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.into(),
        reason: reason.into(),
    }
}
