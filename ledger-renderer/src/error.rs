//! Errors raised while building or rendering an artifact.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Tera failed to parse a template or render the artifact.
    #[error("artifact template error: {0}")]
    Tera(#[from] tera::Error),

    /// The artifact context could not be turned into a tera context.
    #[error("artifact context error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A workspace template override could not be read.
    #[error("cannot read template override {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}
