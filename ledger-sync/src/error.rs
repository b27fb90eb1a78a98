//! Error types for ledger-sync.

use std::path::PathBuf;

use thiserror::Error;

use ledger_core::{EntityId, StoreError};
use ledger_renderer::RenderError;

/// All errors that can arise from projection, generation and reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Canonical store failure (`NotFound`, `Corrupt`, `Conflict`, ...), verbatim.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An error from the rendering engine.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// SQLite cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (sync state, cache values).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Mapping an artifact edit back into the canonical record failed.
    /// Nothing was written.
    #[error("reconciliation of '{entity}' failed: {reason}")]
    ReconciliationFailed { entity: EntityId, reason: String },

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// `true` when the canonical file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_not_found())
    }

    /// `true` for an optimistic-concurrency failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::Conflict { .. }))
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Run blocking file or SQLite work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}
