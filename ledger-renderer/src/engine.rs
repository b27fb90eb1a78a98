//! Tera rendering engine: [`TemplateEngine`] and [`Renderer`].
//!
//! The artifact is assembled from one entry template plus shared partials.
//! A workspace may override any of them by dropping a `.tera` file with the
//! same relative name under `<workspace>/.ledger/templates/`, e.g.
//! `shared/_live.tera`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use crate::context::ArtifactContext;
use crate::error::RenderError;

/// Entry template for `dashboard.md`.
pub const ARTIFACT_TEMPLATE: &str = "artifact/dashboard.md.tera";

// ---------------------------------------------------------------------------
// Embedded templates, baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

const TPLS: &[(&str, &str)] = &[
    ("shared/_header.tera", include_str!("templates/_partials/header.tera")),
    ("shared/_fields.tera", include_str!("templates/_partials/fields.tera")),
    (
        "shared/_narrative.tera",
        include_str!("templates/_partials/narrative.tera"),
    ),
    ("shared/_live.tera", include_str!("templates/_partials/live.tera")),
    ("shared/_footer.tera", include_str!("templates/_partials/footer.tera")),
    (ARTIFACT_TEMPLATE, include_str!("templates/dashboard.md.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io {
        path: path.into(),
        source,
    }
}

fn normalize_template_name(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

fn collect_template_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            collect_template_files(&path, out)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn load_user_templates(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files = Vec::new();
    collect_template_files(dir, &mut files)?;
    files.sort();
    let mut templates = Vec::new();
    for path in files {
        if path.extension().and_then(|s| s.to_str()) != Some("tera") {
            continue;
        }
        let rel = path.strip_prefix(dir).unwrap_or(path.as_path());
        let name = normalize_template_name(rel);
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        templates.push((name, contents));
    }
    Ok(templates)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = HashMap::new();
    for (name, content) in TPLS {
        templates.insert(
            normalize_template_name(Path::new(name)),
            (*content).to_string(),
        );
    }
    if let Some(dir) = user_template_dir {
        for (name, content) in load_user_templates(dir)? {
            templates.insert(name, content);
        }
    }

    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    let items: Vec<(String, String)> = templates.into_iter().collect();
    tera.add_raw_templates(items)?;
    Ok(tera)
}

/// Normalize line endings, collapse runs of blank lines left behind by
/// skipped template blocks, and end with exactly one newline.
fn tidy(rendered: &str) -> String {
    let text = rendered.replace("\r\n", "\n");
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    for ch in text.trim().chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(ch);
    }
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// TemplateEngine
// ---------------------------------------------------------------------------

/// Tera-based engine with optional user overrides.
pub struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    /// Load embedded templates plus any overrides found in `user_template_dir`.
    pub fn new(user_template_dir: Option<&Path>) -> Result<Self, RenderError> {
        let tera = build_tera(user_template_dir)?;
        Ok(TemplateEngine { tera })
    }

    /// Render the artifact body (everything below the generation marker).
    pub fn render_body(&self, ctx: &ArtifactContext) -> Result<String, RenderError> {
        let tera_ctx = ctx.to_tera_context()?;
        let rendered = self.tera.render(ARTIFACT_TEMPLATE, &tera_ctx)?;
        Ok(tidy(&rendered))
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Renders complete `dashboard.md` documents, marker line included.
///
/// Create once and reuse.
pub struct Renderer {
    engine: TemplateEngine,
}

impl Renderer {
    /// Renderer with embedded templates only.
    pub fn new() -> Result<Self, RenderError> {
        Ok(Renderer {
            engine: TemplateEngine::new(None)?,
        })
    }

    /// Renderer that prefers templates found under `dir`.
    pub fn with_overrides(dir: &Path) -> Result<Self, RenderError> {
        Ok(Renderer {
            engine: TemplateEngine::new(Some(dir))?,
        })
    }

    /// Render the full document: marker line, then body.
    pub fn render(&self, ctx: &ArtifactContext) -> Result<String, RenderError> {
        let body = self.engine.render_body(ctx)?;
        Ok(format!("{}\n{body}", ctx.marker.line()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LiveItem, LiveSection};
    use crate::marker::{parse_marker, strip_marker};
    use chrono::{TimeZone, Utc};
    use ledger_core::{CanonicalRecord, EntityId, EntityRef, EntityType, Revision};
    use std::fs;
    use tempfile::TempDir;

    fn acme() -> EntityRef {
        EntityRef {
            id: EntityId::from("acme"),
            entity_type: EntityType::Account,
            name: "Acme".to_string(),
            dir: PathBuf::from("/ws/Accounts/Acme"),
        }
    }

    fn ctx(live: &[LiveSection]) -> ArtifactContext {
        let mut record = CanonicalRecord::new(EntityType::Account);
        record.set_field("health", "green");
        record.narrative.overview = Some("Freight carrier.".to_string());
        ArtifactContext::build(
            &acme(),
            &record,
            &Revision::of("rev"),
            live,
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap(),
        )
    }

    #[test]
    fn renderer_new_succeeds() {
        Renderer::new().expect("Renderer::new should succeed with embedded templates");
    }

    #[test]
    fn rendered_document_starts_with_parseable_marker() {
        let ctx = ctx(&[]);
        let doc = Renderer::new().unwrap().render(&ctx).unwrap();
        assert_eq!(doc.lines().next(), Some(ctx.marker.line().as_str()));
        let marker = parse_marker(&doc).expect("marker");
        assert_eq!(marker.revision, Revision::of("rev"));
        assert!(strip_marker(&doc).starts_with("# Acme\n"));
        assert!(doc.ends_with("._\n"));
        assert!(!doc.contains("\n\n\n"));
    }

    #[test]
    fn live_sections_render_wrapped_in_markers() {
        let live = vec![
            LiveSection {
                key: "meetings".to_string(),
                title: "Upcoming meetings".to_string(),
                items: vec![LiveItem::new("QBR").with_detail("2026-10-21")],
                degraded: false,
            },
            LiveSection {
                key: "signals".to_string(),
                title: "Signals".to_string(),
                items: vec![],
                degraded: true,
            },
        ];
        let doc = Renderer::new().unwrap().render(&ctx(&live)).unwrap();
        assert!(doc.contains(
            "<!-- ledger:live:begin meetings -->\n<!-- generated from live data: do not edit, changes here are discarded -->\n## Upcoming meetings\n\n- QBR (2026-10-21)\n<!-- ledger:live:end meetings -->"
        ));
        assert!(doc.contains("_Unavailable right now._\n<!-- ledger:live:end signals -->"));
    }

    #[test]
    fn user_override_replaces_embedded_partial() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("shared")).unwrap();
        fs::write(
            tmp.path().join("shared/_header.tera"),
            "# Custom {{ header.name }}\n",
        )
        .unwrap();
        let doc = Renderer::with_overrides(tmp.path())
            .unwrap()
            .render(&ctx(&[]))
            .unwrap();
        assert!(strip_marker(&doc).starts_with("# Custom Acme\n"));
    }

    #[test]
    fn tidy_collapses_blank_runs() {
        assert_eq!(tidy("\n\na\r\n\n\n\nb\n\n"), "a\n\nb\n");
    }
}
