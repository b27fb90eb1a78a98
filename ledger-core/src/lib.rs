//! Ledger core library: domain types, canonical store, workspace layout, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and the canonical record
//! - [`error`]: [`StoreError`]
//! - [`store`]: atomic load / save with optimistic concurrency
//! - [`migrate`]: schema version migration
//! - [`workspace`]: on-disk layout, entity discovery and creation
//! - [`config`]: engine configuration

pub mod config;
pub mod error;
pub mod migrate;
pub mod store;
pub mod types;
pub mod workspace;

pub use config::EngineConfig;
pub use error::StoreError;
pub use store::{Loaded, Saved};
pub use types::{
    CanonicalRecord, EntityId, EntityRef, EntityType, FieldValue, FileKind, Narrative,
    NarrativeSection, Revision,
};
pub use workspace::Workspace;
