//! `ledgerd` runtime: change watcher, sync orchestrator and socket server.

pub mod enricher;
mod error;
pub mod orchestrator;
pub mod protocol;
mod runtime;
pub mod watcher;

pub use enricher::{CommandEnricher, Unconfigured};
pub use error::DaemonError;
pub use orchestrator::{Orchestrator, StateChange};
pub use protocol::{
    request_reconcile, request_regenerate, request_status, request_stop, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use watcher::{ChangeRecord, Debouncer};
