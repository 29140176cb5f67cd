use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use rudder_core::store::{apps_dir_at, status_dir_at};
use rudder_core::{duration, AppName, AppRecord, HealthStatus, SyncStatusCode, Trigger};
use rudder_sync::SyncRequest;

use crate::controller::{Controller, PassOutcome};
use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run one command against an in-process controller, for when no daemon is
/// listening.
pub fn execute_local(home: &Path, request: DaemonRequest) -> Result<Value, DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async {
        let controller = Controller::open(home)?;
        dispatch(&controller, request).await
    })
}

/// Run the daemon: scheduler, definition watcher, socket server and signal
/// handler, until one of them asks for shutdown.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let controller = Controller::open(&home)?;
    let started_at_unix = unix_seconds_now();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let controller = controller.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = scheduler_task(controller, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let controller = controller.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(home, controller, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let controller = controller.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                controller,
                shutdown.clone(),
                shutdown_rx,
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
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

    let (scheduler_result, watcher_result, socket_result, signal_result) =
        tokio::join!(scheduler_handle, watcher_handle, socket_handle, signal_handle);

    handle_join("scheduler", scheduler_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Execute a command against `controller`. `status` and `stop` belong to
/// the socket server and are rejected here.
pub async fn dispatch(
    controller: &Arc<Controller>,
    request: DaemonRequest,
) -> Result<Value, DaemonError> {
    let cmd = request.name();
    match request {
        DaemonRequest::List => Ok(Value::Array(
            controller.list().await.iter().map(summarize).collect(),
        )),
        DaemonRequest::Get { app } => {
            let record = controller
                .get(&AppName::from(app.as_str()))
                .await
                .ok_or(DaemonError::UnknownApp { name: app })?;
            Ok(serde_json::to_value(record)?)
        }
        DaemonRequest::Sync {
            app,
            dry_run,
            force,
            prune,
        } => {
            let name = AppName::from(app.as_str());
            let request = SyncRequest {
                trigger: Trigger::Manual,
                dry_run,
                force,
                prune,
            };
            outcome_payload(&name, controller.sync(&name, request).await?)
        }
        DaemonRequest::Refresh { app } => {
            let name = AppName::from(app.as_str());
            outcome_payload(&name, controller.refresh(&name).await?)
        }
        DaemonRequest::Terminate { app } => {
            let terminated = controller.terminate(&AppName::from(app.as_str())).await?;
            Ok(json!({ "app": app, "terminated": terminated }))
        }
        DaemonRequest::Delete { app, cascade } => {
            let deleted = controller
                .delete(&AppName::from(app.as_str()), cascade)
                .await?;
            Ok(json!({ "deleted": deleted, "cascade": cascade }))
        }
        DaemonRequest::Diff { app } => {
            let diffs = controller.diff(&AppName::from(app.as_str())).await?;
            Ok(serde_json::to_value(diffs)?)
        }
        DaemonRequest::Status | DaemonRequest::Stop => Err(DaemonError::Protocol(format!(
            "'{cmd}' is only served by a running daemon"
        ))),
    }
}

fn outcome_payload(name: &AppName, outcome: PassOutcome) -> Result<Value, DaemonError> {
    match outcome {
        PassOutcome::Reconciled(status) => Ok(json!({
            "app": name,
            "coalesced": false,
            "status": serde_json::to_value(status)?,
        })),
        PassOutcome::Coalesced => Ok(json!({ "app": name, "coalesced": true })),
    }
}

/// One row of `list`.
pub fn summarize(record: &AppRecord) -> Value {
    let status = &record.status;
    json!({
        "name": record.app.name,
        "parent": record.parent,
        "sync": status.sync,
        "health": status.health,
        "revision": status.revision,
        "synced_revision": status.synced_revision,
        "phase": status.operation.as_ref().map(|op| op.phase),
        "orphaned": status.orphaned,
        "reconciled_at": status.reconciled_at,
    })
}

async fn scheduler_task(
    controller: Arc<Controller>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(controller.config().poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let started = Instant::now();
                match controller.reconcile_all().await {
                    Ok(()) => tracing::info!(
                        duration_ms = started.elapsed().as_millis() as u64,
                        "scheduled pass completed",
                    ),
                    Err(err) => tracing::error!(error = %err, "scheduled pass failed"),
                }
            }
        }
    }
    Ok(())
}

async fn watcher_task(
    home: PathBuf,
    controller: Arc<Controller>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let apps = apps_dir_at(&home);
    if !apps.exists() {
        fs::create_dir_all(&apps).map_err(|e| io_err(&apps, e))?;
    }
    let apps = fs::canonicalize(&apps).unwrap_or(apps);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&apps, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %apps.display(), "watching application definitions");

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if !is_definition_file(&path, &apps) {
                        continue;
                    }
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }

                    let controller = controller.clone();
                    tokio::spawn(async move {
                        let file = path.display();
                        match controller.reconcile_definition_file(&path).await {
                            Ok(()) => tracing::info!(file = %file, "watcher-triggered pass completed"),
                            Err(err) => tracing::error!(file = %file, error = %err, "watcher-triggered pass failed"),
                        }
                    });
                }
            }
        }
    }

    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    controller: Arc<Controller>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let controller = controller.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        controller,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
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
    home: PathBuf,
    controller: Arc<Controller>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
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

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request == DaemonRequest::Stop;
        let response = match request {
            DaemonRequest::Status => {
                DaemonResponse::ok(build_status_payload(&home, &controller, started_at_unix).await)
            }
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => {
                let cmd = other.name();
                match dispatch(&controller, other).await {
                    Ok(data) => DaemonResponse::ok(data),
                    Err(err) => {
                        tracing::warn!(cmd, error = %err, "command failed");
                        DaemonResponse::error(err.to_string())
                    }
                }
            }
        };

        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(home: &Path, controller: &Controller, started_at_unix: u64) -> Value {
    let records = controller.list().await;
    let out_of_sync = records
        .iter()
        .filter(|r| r.status.sync == SyncStatusCode::OutOfSync)
        .count();
    let degraded = records
        .iter()
        .filter(|r| r.status.health == HealthStatus::Degraded)
        .count();
    let in_flight: Vec<String> = controller.running().into_iter().map(|n| n.0).collect();

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": started_at_unix,
        "apps": records.len(),
        "out_of_sync": out_of_sync,
        "degraded": degraded,
        "in_flight": in_flight,
        "poll_interval": duration::format(controller.config().poll_interval),
        "workers": controller.config().workers,
        "socket": socket_path(home).display().to_string(),
        "apps_dir": apps_dir_at(home).display().to_string(),
    })
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn is_definition_file(path: &Path, apps: &Path) -> bool {
    path.starts_with(apps)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false)
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

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [apps_dir_at(home), status_dir_at(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
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

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
