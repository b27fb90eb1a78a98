//! Generation marker and live-section markers embedded in `dashboard.md`.
//!
//! The first line of every generated artifact is
//!
//! ```text
//! <!-- ledger:generated at=2026-10-19T09:30:00.000Z revision=<sha256> -->
//! ```
//!
//! and every live section is wrapped in
//! `<!-- ledger:live:begin <key> -->` / `<!-- ledger:live:end <key> -->` so
//! that edits inside it can be told apart from edits to narrative content.

use chrono::{DateTime, SecondsFormat, Utc};

use ledger_core::Revision;

pub const GENERATED_PREFIX: &str = "<!-- ledger:generated";
const LIVE_BEGIN: &str = "<!-- ledger:live:begin ";
const LIVE_END: &str = "<!-- ledger:live:end ";
const MARKER_SUFFIX: &str = " -->";

/// Parsed first line of a generated artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationMarker {
    pub generated_at: DateTime<Utc>,
    pub revision: Revision,
}

impl GenerationMarker {
    pub fn new(generated_at: DateTime<Utc>, revision: Revision) -> Self {
        Self {
            generated_at,
            revision,
        }
    }

    /// The marker line, without trailing newline.
    pub fn line(&self) -> String {
        format!(
            "{GENERATED_PREFIX} at={} revision={}{MARKER_SUFFIX}",
            self.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.revision
        )
    }
}

/// Parse the marker from the first line of `content`.
pub fn parse_marker(content: &str) -> Option<GenerationMarker> {
    let first = content.lines().next()?.trim();
    let body = first
        .strip_prefix(GENERATED_PREFIX)?
        .strip_suffix(MARKER_SUFFIX)?;
    let mut generated_at = None;
    let mut revision = None;
    for token in body.split_whitespace() {
        if let Some(at) = token.strip_prefix("at=") {
            generated_at = DateTime::parse_from_rfc3339(at)
                .ok()
                .map(|t| t.with_timezone(&Utc));
        } else if let Some(rev) = token.strip_prefix("revision=") {
            revision = Some(Revision(rev.to_string()));
        }
    }
    Some(GenerationMarker {
        generated_at: generated_at?,
        revision: revision?,
    })
}

/// `content` without its marker line. Content without a marker is returned as is.
pub fn strip_marker(content: &str) -> &str {
    if !content.starts_with(GENERATED_PREFIX) {
        return content;
    }
    match content.find('\n') {
        Some(idx) => &content[idx + 1..],
        None => "",
    }
}

/// `<!-- ledger:live:begin key -->`
pub fn live_begin(key: &str) -> String {
    format!("{LIVE_BEGIN}{key}{MARKER_SUFFIX}")
}

/// `<!-- ledger:live:end key -->`
pub fn live_end(key: &str) -> String {
    format!("{LIVE_END}{key}{MARKER_SUFFIX}")
}

fn live_key(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(LIVE_BEGIN)?
        .strip_suffix(MARKER_SUFFIX)
        .map(str::trim)
}

/// Remove every live section (markers included) from `content`.
///
/// An unterminated section runs to the end of the document.
pub fn strip_live_sections(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut inside: Option<String> = None;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        match &inside {
            Some(key) => {
                if trimmed == live_end(key) {
                    inside = None;
                }
            }
            None => {
                if let Some(key) = live_key(line) {
                    inside = Some(key.to_string());
                } else {
                    out.push_str(line);
                }
            }
        }
    }
    out
}
