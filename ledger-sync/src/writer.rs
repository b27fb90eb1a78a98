//! Artifact writer: hash-gated atomic write of `dashboard.md`.
//!
//! ## Protocol
//!
//! 1. Normalise line endings and hash the rendered body (marker excluded).
//! 2. Hash the on-disk body the same way.
//! 3. Equal → skip; the file and its mtime stay untouched.
//! 4. Otherwise write `dashboard.md.ledger.tmp` and rename over the artifact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use ledger_core::store;
use ledger_renderer::marker::strip_marker;

use crate::error::{io_err, SyncError};

/// Outcome of an artifact write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// File was written (content changed or did not previously exist).
    Written {
        path: PathBuf,
        hash: String,
        modified: SystemTime,
    },
    /// Rendered body matches the file on disk.
    Unchanged {
        path: PathBuf,
        hash: String,
        modified: SystemTime,
    },
}

impl WriteResult {
    pub fn hash(&self) -> &str {
        match self {
            WriteResult::Written { hash, .. } | WriteResult::Unchanged { hash, .. } => hash,
        }
    }

    pub fn modified(&self) -> SystemTime {
        match self {
            WriteResult::Written { modified, .. } | WriteResult::Unchanged { modified, .. } => {
                *modified
            }
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }
}

/// SHA-256 hex of `content` with CRLF normalised to LF.
pub fn content_hash(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    hex::encode(h.finalize())
}

/// Hash of an artifact document, ignoring its generation marker.
pub fn artifact_hash(document: &str) -> String {
    content_hash(strip_marker(&document.replace("\r\n", "\n")))
}

/// Read `path`, `None` when absent.
pub fn read_artifact(path: &Path) -> Result<Option<String>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Atomically write `document` to `path` unless the body already matches.
pub fn write_artifact(path: &Path, document: &str) -> Result<WriteResult, SyncError> {
    let document = document.replace("\r\n", "\n");
    let hash = artifact_hash(&document);

    if let Some(existing) = read_artifact(path)? {
        if artifact_hash(&existing) == hash {
            tracing::debug!("unchanged: {}", path.display());
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
                hash,
                modified: store::modified_at(path)?,
            });
        }
    }

    let modified = store::write_atomic(path, &document)?;
    tracing::info!("wrote: {}", path.display());
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
        hash,
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DOC_T1: &str =
        "<!-- ledger:generated at=2026-10-19T09:00:00.000Z revision=aa -->\n# Acme\n";
    const DOC_T2: &str =
        "<!-- ledger:generated at=2026-10-19T10:00:00.000Z revision=aa -->\n# Acme\n";

    #[test]
    fn first_write_returns_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Accounts/Acme/dashboard.md");
        let result = write_artifact(&path, DOC_T1).unwrap();
        assert!(result.was_written());
        assert_eq!(fs::read_to_string(&path).unwrap(), DOC_T1);
    }

    #[test]
    fn same_body_with_new_marker_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dashboard.md");
        write_artifact(&path, DOC_T1).unwrap();
        let result = write_artifact(&path, DOC_T2).unwrap();
        assert!(!result.was_written());
        assert_eq!(fs::read_to_string(&path).unwrap(), DOC_T1);
    }

    #[test]
    fn changed_body_returns_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dashboard.md");
        write_artifact(&path, DOC_T1).unwrap();
        let result = write_artifact(&path, &DOC_T2.replace("Acme", "Acme Corp")).unwrap();
        assert!(result.was_written());
    }

    #[test]
    fn crlf_and_lf_content_share_the_same_hash() {
        assert_eq!(content_hash("a\r\nb\r\n"), content_hash("a\nb\n"));
        assert_eq!(artifact_hash(DOC_T1), artifact_hash(DOC_T2));
    }

    #[test]
    fn tmp_file_removed_after_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dashboard.md");
        write_artifact(&path, DOC_T1).unwrap();
        assert!(!store::tmp_path(&path).exists());
    }
}
