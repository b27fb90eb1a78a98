use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use ledger_core::{EntityId, EntityRef, Workspace};
use ledger_sync::{Enricher, GenerationStatus, RegenerationReason, RegenerationReport, SyncEngine};

use crate::error::{io_err, DaemonError};
use crate::orchestrator::Orchestrator;
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::watcher::{self, ChangeRecord};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(
    workspace: Workspace,
    enricher: Arc<dyn Enricher>,
    json_logs: bool,
) -> Result<(), DaemonError> {
    init_tracing(json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(workspace, enricher))
}

/// Run watcher, change handler, sweep and socket server until stopped.
pub async fn run(workspace: Workspace, enricher: Arc<dyn Enricher>) -> Result<(), DaemonError> {
    let workspace = match fs::canonicalize(workspace.root()) {
        Ok(root) => Workspace::new(root),
        Err(err) => return Err(io_err(workspace.root(), err)),
    };
    let ledger_dir = workspace.ledger_dir();
    fs::create_dir_all(&ledger_dir).map_err(|e| io_err(&ledger_dir, e))?;

    let engine = SyncEngine::open(workspace.clone())?;
    let debounce = engine.config().debounce();
    let sweep_interval = engine.config().sweep_interval();
    let orchestrator = Orchestrator::new(engine, enricher);
    let started_at = Utc::now();

    let (change_tx, change_rx) = mpsc::channel::<ChangeRecord>(256);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let workspace = workspace.clone();
        tokio::spawn(async move {
            let result = watcher::run(workspace, debounce, change_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let changes_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result = change_task(orchestrator, change_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let sweep_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result = sweep_task(orchestrator, sweep_interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                orchestrator,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(workspace = %workspace.root().display(), "ledgerd started");

    let (watcher_result, changes_result, sweep_result, socket_result, signal_result) = tokio::join!(
        watcher_handle,
        changes_handle,
        sweep_handle,
        socket_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("change_handler", changes_result)?;
    handle_join("sweep", sweep_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("ledgerd stopped");
    Ok(())
}

async fn change_task(
    orchestrator: Orchestrator,
    mut change_rx: mpsc::Receiver<ChangeRecord>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            change = change_rx.recv() => {
                let Some(change) = change else { break };
                match orchestrator.on_entity_changed(&change.entity).await {
                    Ok(state) => tracing::debug!(
                        entity = %change.entity.id,
                        kind = %change.kind,
                        %state,
                        "change handled",
                    ),
                    Err(err) => tracing::warn!(
                        entity = %change.entity.id,
                        error = %err,
                        "change handling failed",
                    ),
                }
            }
        }
    }
    Ok(())
}

/// Pull-check every entity now and then on every interval tick.
async fn sweep_task(
    orchestrator: Orchestrator,
    every: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match orchestrator.sweep().await {
                    Ok(checked) => tracing::debug!(checked, "sweep completed"),
                    Err(err) => tracing::warn!(error = %err, "sweep failed"),
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    orchestrator: Orchestrator,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = orchestrator.engine().workspace().socket_path();
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let orchestrator = orchestrator.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, orchestrator, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    orchestrator: Orchestrator,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = if stop {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        } else {
            match dispatch(&orchestrator, &request, started_at).await {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Execute one non-`stop` command.
pub(crate) async fn dispatch(
    orchestrator: &Orchestrator,
    request: &DaemonRequest,
    started_at: DateTime<Utc>,
) -> Result<Value, DaemonError> {
    match request.cmd.as_str() {
        "status" => build_status_payload(orchestrator, started_at).await,
        "state" => {
            let entity = resolve_entity(orchestrator, request).await?;
            Ok(json!({
                "entity": entity.id,
                "state": orchestrator.get_state(&entity.id),
            }))
        }
        "check" => {
            let entity = resolve_entity(orchestrator, request).await?;
            let state = orchestrator.reconcile_now(&entity).await?;
            Ok(json!({ "entity": entity.id, "state": state }))
        }
        "regenerate" => {
            let entity = resolve_entity(orchestrator, request).await?;
            let report = orchestrator
                .trigger_regeneration(&entity, RegenerationReason::Requested)
                .await?;
            Ok(report_payload(&report))
        }
        "reconcile" => {
            let entity = resolve_entity(orchestrator, request).await?;
            let report = orchestrator.request_reconciliation(&entity).await?;
            Ok(json!({
                "entity": entity.id,
                "applied": report.applied,
                "revision": report.revision,
                "regeneration": report_payload(&report.regeneration),
            }))
        }
        "rebuild-cache" => {
            let report = orchestrator.engine().rebuild_cache().await?;
            let skipped: Vec<Value> = report
                .skipped
                .iter()
                .map(|(id, reason)| json!({ "entity": id, "reason": reason }))
                .collect();
            Ok(json!({ "projected": report.projected, "skipped": skipped }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    }
}

async fn resolve_entity(
    orchestrator: &Orchestrator,
    request: &DaemonRequest,
) -> Result<EntityRef, DaemonError> {
    let Some(id) = request.entity.as_deref() else {
        return Err(DaemonError::Protocol(format!(
            "command '{}' needs an entity",
            request.cmd
        )));
    };
    orchestrator
        .engine()
        .entity(&EntityId::from(id))
        .await
        .map_err(|err| {
            if err.is_not_found() {
                DaemonError::Protocol(format!("unknown entity '{id}'"))
            } else {
                err.into()
            }
        })
}

async fn build_status_payload(
    orchestrator: &Orchestrator,
    started_at: DateTime<Utc>,
) -> Result<Value, DaemonError> {
    let engine = orchestrator.engine();
    let entities: Vec<Value> = engine
        .entities()
        .await?
        .into_iter()
        .map(|entity| {
            json!({
                "id": entity.id,
                "type": entity.entity_type,
                "name": entity.name,
                "state": orchestrator.get_state(&entity.id),
            })
        })
        .collect();

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at,
        "workspace": engine.workspace().root().display().to_string(),
        "socket": engine.workspace().socket_path().display().to_string(),
        "entities": entities,
    }))
}

fn report_payload(report: &RegenerationReport) -> Value {
    let degraded: Vec<String> = match &report.status {
        GenerationStatus::Complete => Vec::new(),
        GenerationStatus::Degraded { sections } => sections.clone(),
    };
    json!({
        "entity": report.entity,
        "reason": report.reason,
        "revision": report.revision,
        "generated_at": report.generated_at,
        "written": report.write.was_written(),
        "degraded_sections": degraded,
        "overwrote_external_edit": report.overwrote_external_edit,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), plain
/// or JSON lines.
pub fn init_tracing(json_logs: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
