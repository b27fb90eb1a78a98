//! Artifact context: serializable rendering payload built from a
//! [`CanonicalRecord`] and the live sections queried for this run.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::{CanonicalRecord, EntityRef, FieldValue, Revision};

use crate::error::RenderError;
use crate::marker::GenerationMarker;

/// Field that drives the header badge.
pub const HEALTH_FIELD: &str = "health";

/// One line of live content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LiveItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A section computed at generation time; never stored canonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSection {
    /// Marker key, e.g. `meetings`.
    pub key: String,
    pub title: String,
    pub items: Vec<LiveItem>,
    /// The source failed or timed out; rendered as unavailable.
    pub degraded: bool,
}

/// Rendering payload for `dashboard.md`.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactContext {
    pub header: HeaderCtx,
    pub fields: Vec<FieldCtx>,
    pub narrative: NarrativeCtx,
    pub live: Vec<LiveSection>,
    pub enrichment: Vec<EnrichmentCtx>,
    pub meta: MetaCtx,
    /// First line of the document; rendered outside the templates.
    #[serde(skip)]
    pub marker: GenerationMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCtx {
    pub name: String,
    pub entity_id: String,
    pub type_label: String,
    pub health: Option<String>,
    pub health_badge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCtx {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeCtx {
    pub overview: Option<String>,
    pub notes: Option<String>,
    pub sections: Vec<SectionCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionCtx {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentCtx {
    pub section: String,
    pub refreshed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCtx {
    pub ledger_version: String,
    pub generated_at: String,
    pub revision: String,
}

impl ArtifactContext {
    /// Build the payload. Everything except `meta.generated_at` is a pure
    /// function of `record`, `revision` and `live`.
    pub fn build(
        entity: &EntityRef,
        record: &CanonicalRecord,
        revision: &Revision,
        live: &[LiveSection],
        generated_at: DateTime<Utc>,
    ) -> Self {
        let health = record
            .field(HEALTH_FIELD)
            .map(|v| v.to_string())
            .filter(|s| !s.trim().is_empty());
        let health_badge = health_badge(health.as_deref());

        let fields = record
            .structured
            .iter()
            .filter(|(_, value)| !matches!(value, FieldValue::Null))
            .map(|(name, value)| FieldCtx {
                name: name.clone(),
                value: value.to_string().replace('|', "\\|").replace('\n', " "),
            })
            .collect();

        let narrative = NarrativeCtx {
            overview: non_blank(record.narrative.overview.as_deref()),
            notes: non_blank(record.narrative.notes.as_deref()),
            sections: record
                .narrative
                .sections
                .iter()
                .map(|s| SectionCtx {
                    title: s.title.trim().to_string(),
                    content: s.content.trim_end().to_string(),
                })
                .collect(),
        };

        let enrichment = record
            .enrichment
            .iter()
            .map(|(section, at)| EnrichmentCtx {
                section: section.clone(),
                refreshed_at: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            })
            .collect();

        let type_label = {
            let label = entity.entity_type.to_string();
            let mut chars = label.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => label,
            }
        };

        ArtifactContext {
            header: HeaderCtx {
                name: entity.name.clone(),
                entity_id: entity.id.0.clone(),
                type_label,
                health,
                health_badge,
            },
            fields,
            narrative,
            live: live.to_vec(),
            enrichment,
            meta: MetaCtx {
                ledger_version: env!("CARGO_PKG_VERSION").to_string(),
                generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                revision: revision.0.clone(),
            },
            marker: GenerationMarker::new(generated_at, revision.clone()),
        }
    }

    /// Convert to a [`tera::Context`] for rendering.
    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}

fn health_badge(health: Option<&str>) -> String {
    let Some(health) = health else {
        return "⚪ unknown".to_string();
    };
    let dot = match health.trim().to_ascii_lowercase().as_str() {
        "green" => "🟢",
        "yellow" | "amber" => "🟡",
        "red" => "🔴",
        _ => "⚪",
    };
    format!("{dot} {}", health.trim())
}

fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim_end)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
