//! # ledger-renderer
//!
//! Tera-based renderer that turns a canonical record plus freshly queried live
//! sections into an entity's `dashboard.md` artifact.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use ledger_core::{store, EntityRef};
//! use ledger_renderer::{ArtifactContext, Renderer};
//!
//! fn render(entity: &EntityRef) {
//!     let (Ok(loaded), Ok(renderer)) = (store::load(entity), Renderer::new()) else {
//!         return;
//!     };
//!     let ctx = ArtifactContext::build(entity, &loaded.record, &loaded.revision, &[], Utc::now());
//!     if let Ok(markdown) = renderer.render(&ctx) {
//!         println!("{markdown}");
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod marker;

pub use context::{ArtifactContext, LiveItem, LiveSection};
pub use engine::{Renderer, TemplateEngine};
pub use error::RenderError;
pub use marker::GenerationMarker;
