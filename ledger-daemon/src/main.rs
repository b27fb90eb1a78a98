//! `ledgerd` keeps a workspace's canonical records, cache and dashboards in sync.
//!
//! ```text
//! ledgerd --workspace <path> [--json-logs] [--enricher <program> [--enricher-arg <arg>]...]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use ledger_core::Workspace;
use ledger_daemon::{start_blocking, CommandEnricher, Unconfigured};
use ledger_sync::Enricher;

#[derive(Parser, Debug)]
#[command(
    name = "ledgerd",
    version,
    about = "Watch an entity workspace and keep its cache and dashboards in sync",
    long_about = None,
)]
struct Cli {
    /// Workspace root holding `Accounts/` and `Projects/`.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Program that answers reconciliation requests (JSON on stdin, JSON on stdout).
    #[arg(long)]
    enricher: Option<String>,

    /// Argument passed to the enricher program. Repeatable.
    #[arg(long = "enricher-arg", requires = "enricher")]
    enricher_args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let enricher: Arc<dyn Enricher> = match cli.enricher {
        Some(program) => Arc::new(CommandEnricher::new(program, cli.enricher_args)),
        None => Arc::new(Unconfigured),
    };
    start_blocking(Workspace::new(cli.workspace), enricher, cli.json_logs)?;
    Ok(())
}
