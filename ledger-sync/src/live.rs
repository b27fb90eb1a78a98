//! Collaborator seams: live-data sources and the enrichment service.
//!
//! Both are external and fallible; callers bound every call with a timeout.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::EntityRef;
use ledger_renderer::LiveItem;

use crate::cache::CacheProjector;

/// A read-only source for one live section of the artifact.
#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Marker key of the section, e.g. `meetings`.
    fn key(&self) -> &str;

    /// Section heading.
    fn title(&self) -> &str;

    async fn query(&self, entity: &EntityRef) -> anyhow::Result<Vec<LiveItem>>;
}

/// Shared handle on a live source.
pub type SharedLiveSource = Arc<dyn LiveSource>;

/// A request to the enrichment service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub instruction: String,
    pub context: serde_json::Value,
}

/// Opaque AI enrichment service. Failure is routine.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: EnrichmentRequest) -> anyhow::Result<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// CacheSignals
// ---------------------------------------------------------------------------

/// Structured field holding the renewal date.
pub const RENEWAL_FIELD: &str = "renewalDate";

/// Built-in live source deriving signals from the cache row.
#[derive(Debug, Clone)]
pub struct CacheSignals {
    cache: CacheProjector,
    renewal_window_days: i64,
    today: Option<NaiveDate>,
}

impl CacheSignals {
    pub fn new(cache: CacheProjector, renewal_window_days: i64) -> Self {
        Self {
            cache,
            renewal_window_days,
            today: None,
        }
    }

    /// Pin "today" instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }
}

#[async_trait]
impl LiveSource for CacheSignals {
    fn key(&self) -> &str {
        "signals"
    }

    fn title(&self) -> &str {
        "Signals"
    }

    async fn query(&self, entity: &EntityRef) -> anyhow::Result<Vec<LiveItem>> {
        let cache = self.cache.clone();
        let id = entity.id.clone();
        let row = tokio::task::spawn_blocking(move || cache.row(&id))
            .await
            .context("cache lookup task failed")??;
        let Some(row) = row else {
            return Ok(vec![]);
        };

        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        let mut items = Vec::new();

        if let Some(renewal) = row.fields.get(RENEWAL_FIELD).and_then(|v| v.as_date()) {
            let days = (renewal - today).num_days();
            if days < 0 {
                items.push(
                    LiveItem::new(format!("Renewal date passed {} days ago", -days))
                        .with_detail(renewal.to_string()),
                );
            } else if days <= self.renewal_window_days {
                items.push(
                    LiveItem::new(format!("Renewal in {days} days"))
                        .with_detail(renewal.to_string()),
                );
            }
        }

        if let Some(health) = row.fields.get("health").and_then(|v| v.as_text()) {
            match health.trim().to_ascii_lowercase().as_str() {
                "red" => items.push(LiveItem::new("Health is red")),
                "yellow" | "amber" => items.push(LiveItem::new("Health needs attention")),
                _ => {}
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{store, CanonicalRecord, EntityType, Workspace};
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    async fn signals_for(fields: &[(&str, &str)]) -> Vec<LiveItem> {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let acme = ws.create_entity(EntityType::Account, "Acme").unwrap();
        let mut record = CanonicalRecord::new(EntityType::Account);
        for (k, v) in fields {
            record.set_field(*k, *v);
        }
        let saved = store::save(&acme, &record, None).unwrap();
        let cache = CacheProjector::for_workspace(&ws);
        cache.project(&acme, &record, &saved.revision).unwrap();
        CacheSignals::new(cache, 60)
            .with_today(today())
            .query(&acme)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upcoming_renewal_raises_signal() {
        let items = signals_for(&[("renewalDate", "2026-12-01"), ("health", "green")]).await;
        assert_eq!(items, vec![LiveItem::new("Renewal in 43 days").with_detail("2026-12-01")]);
    }

    #[tokio::test]
    async fn distant_renewal_is_quiet() {
        let items = signals_for(&[("renewalDate", "2027-06-01")]).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn overdue_renewal_and_red_health() {
        let items = signals_for(&[("renewalDate", "2026-10-09"), ("health", "red")]).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text, "Renewal date passed 10 days ago");
        assert_eq!(items[1].text, "Health is red");
    }

    #[tokio::test]
    async fn unprojected_entity_has_no_signals() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let acme = ws.create_entity(EntityType::Account, "Acme").unwrap();
        let items = CacheSignals::new(CacheProjector::for_workspace(&ws), 60)
            .query(&acme)
            .await
            .unwrap();
        assert!(items.is_empty());
    }
}
