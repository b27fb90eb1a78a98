//! # ledger-sync
//!
//! Cache projection, artifact generation, external-edit detection and
//! reconciliation for the entity ledger.
//!
//! [`SyncEngine`] is the entry point: one method per engine operation over a
//! single workspace.

pub mod cache;
pub mod detect;
pub mod diff;
pub mod error;
pub mod generator;
pub mod live;
pub mod pipeline;
pub mod reconcile;
pub mod sync_state;
pub mod writer;

pub use cache::{CacheProjector, CacheRow, RebuildReport};
pub use detect::Observation;
pub use error::SyncError;
pub use generator::{GeneratedArtifact, GenerationStatus, Generator};
pub use live::{CacheSignals, EnrichmentRequest, Enricher, LiveSource, SharedLiveSource};
pub use pipeline::{RegenerationReason, RegenerationReport, SyncEngine};
pub use reconcile::{EntityState, NarrativePatch, ReconcileReport};
pub use sync_state::SyncState;
pub use writer::WriteResult;

pub use ledger_renderer::{LiveItem, LiveSection};
