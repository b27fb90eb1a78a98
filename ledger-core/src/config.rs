//! Engine configuration read from `<workspace>/.ledger/config.yaml`.
//!
//! Every key is optional; a missing file yields [`EngineConfig::default`].

use std::io::ErrorKind;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-path watcher debounce window.
    pub debounce_ms: u64,
    /// Bound on each live-section query during generation.
    pub live_query_timeout_ms: u64,
    /// Bound on the enrichment call during reconciliation.
    pub enrichment_timeout_ms: u64,
    /// Interval of the pull-verification sweep.
    pub sweep_interval_secs: u64,
    /// Renewals closer than this raise a signal.
    pub renewal_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            live_query_timeout_ms: 2_000,
            enrichment_timeout_ms: 30_000,
            sweep_interval_secs: 60,
            renewal_window_days: 60,
        }
    }
}

impl EngineConfig {
    /// Load the workspace config, falling back to defaults when absent.
    pub fn load(workspace: &Workspace) -> Result<Self, StoreError> {
        let path = workspace.config_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(io_err(&path, err)),
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| StoreError::Config { path, source })
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn live_query_timeout(&self) -> Duration {
        Duration::from_millis(self.live_query_timeout_ms)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
