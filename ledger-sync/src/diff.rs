//! Artifact diffs: outside-live edits for reconciliation, and dry-run preview.

use similar::{ChangeTag, TextDiff};

use ledger_core::EntityRef;
use ledger_renderer::marker::{strip_live_sections, strip_marker};

use crate::error::SyncError;
use crate::generator::Generator;
use crate::writer::read_artifact;

/// Edits made to an artifact outside its live sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactEdits {
    pub unified_diff: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ArtifactEdits {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare `current` against `base`, ignoring markers and live sections.
pub fn artifact_edits(base: &str, current: &str) -> ArtifactEdits {
    let base = comparable(base);
    let current = comparable(current);
    if base == current {
        return ArtifactEdits::default();
    }

    let diff = TextDiff::from_lines(&base, &current);
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n').to_string();
        match change.tag() {
            ChangeTag::Insert => added.push(line),
            ChangeTag::Delete => removed.push(line),
            ChangeTag::Equal => {}
        }
    }
    let unified_diff = diff
        .unified_diff()
        .header("generated", "edited")
        .context_radius(3)
        .to_string();

    ArtifactEdits {
        unified_diff,
        added,
        removed,
    }
}

/// Render what a regeneration would write and diff it against the file on
/// disk. Nothing is written. `None` when only the marker would change.
pub async fn preview(
    generator: &Generator,
    entity: &EntityRef,
) -> Result<Option<String>, SyncError> {
    let rendered = generator.generate(entity).await?;
    let path = entity.artifact_path();
    let existing = read_artifact(&path)?.unwrap_or_default();

    let old = normalize(strip_marker(&normalize(&existing)));
    let new = normalize(strip_marker(&rendered.content));
    if old == new {
        return Ok(None);
    }

    let relative = format!("{}/{}/dashboard.md", entity.entity_type.dir_name(), entity.name);
    let unified = TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header(&format!("a/{relative}"), &format!("b/{relative}"))
        .context_radius(3)
        .to_string();
    Ok(Some(unified))
}

fn comparable(document: &str) -> String {
    let normalized = normalize(document);
    strip_live_sections(strip_marker(&normalized))
}

fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n")
}
