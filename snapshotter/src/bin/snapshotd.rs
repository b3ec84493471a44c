// snapshotd: registry daemon holding references to captured processes
//
// Responsibilities:
// - Own the snapshot registry (one lock around every capture/rebind)
// - Hold a pidfd per tracked process until it is released or rebound
// - Expose the Unix socket protocol for snapctl
// - Release every held reference on shutdown

use anyhow::{Context, Result};
use snapshotter_lib::{
    logging,
    snapshot::{
        config::Config,
        control::{RegistryControl, RegistryError},
        protocol::{
            deserialize_message, serialize_message, DaemonErrorCode, DaemonRequest,
            DaemonResponse, EntryView, StatusCode, MAX_REQUEST_FRAME_SIZE, PROTOCOL_VERSION,
        },
    },
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// Daemon state shared across all client connections
struct DaemonState {
    registry: RegistryControl,
    /// Set once shutdown is requested; registry mutations are refused from then on
    shutting_down: AtomicBool,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            registry: RegistryControl::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn unavailable_if_shutting_down(&self) -> Option<DaemonResponse> {
        self.shutting_down
            .load(Ordering::SeqCst)
            .then(|| DaemonResponse::Error {
                code: DaemonErrorCode::DaemonUnavailable,
                message: "Daemon is shutting down".to_string(),
            })
    }
}

fn status_response(result: Result<Option<EntryView>, RegistryError>) -> DaemonResponse {
    match result {
        Ok(entry) => DaemonResponse::Status {
            code: StatusCode::Ok,
            message: None,
            entry,
        },
        Err(err) => DaemonResponse::Status {
            code: err.status(),
            message: Some(err.to_string()),
            entry: None,
        },
    }
}

/// Handle a single client connection
async fn handle_client(
    state: Arc<DaemonState>,
    mut stream: UnixStream,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let response = if line.len() > MAX_REQUEST_FRAME_SIZE {
                    DaemonResponse::Error {
                        code: DaemonErrorCode::InvalidRequest,
                        message: format!(
                            "Request frame too large: {} bytes (max {})",
                            line.len(),
                            MAX_REQUEST_FRAME_SIZE
                        ),
                    }
                } else {
                    match deserialize_message::<DaemonRequest>(line.as_bytes()) {
                        Ok(request) => handle_request(&state, request, &shutdown_tx).await,
                        Err(e) => DaemonResponse::Error {
                            code: DaemonErrorCode::InvalidRequest,
                            message: format!("Failed to parse request: {}", e),
                        },
                    }
                };

                let bytes = serialize_message(&response)?;
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading from client");
                break;
            }
        }
    }

    Ok(())
}

/// Handle a single request and return the response
async fn handle_request(
    state: &Arc<DaemonState>,
    request: DaemonRequest,
    shutdown_tx: &tokio::sync::mpsc::Sender<()>,
) -> DaemonResponse {
    match request {
        DaemonRequest::Handshake { client_version } => {
            if client_version != PROTOCOL_VERSION {
                let message = if client_version < PROTOCOL_VERSION {
                    "Daemon is newer than snapctl, please update snapctl.".to_string()
                } else {
                    "Daemon is outdated, please restart it.".to_string()
                };
                return DaemonResponse::Error {
                    code: DaemonErrorCode::VersionMismatch,
                    message,
                };
            }
            DaemonResponse::Handshake {
                protocol_version: PROTOCOL_VERSION,
            }
        }

        DaemonRequest::Ping => DaemonResponse::Pong,

        DaemonRequest::Shutdown => {
            state.shutting_down.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(()).await;
            DaemonResponse::ShuttingDown
        }

        DaemonRequest::List => DaemonResponse::Entries {
            entries: state.registry.entries(),
        },

        // Registry operations read procfs and take the registry lock; keep
        // them off the async workers.
        DaemonRequest::Capture { pid } => {
            if let Some(refusal) = state.unavailable_if_shutting_down() {
                return refusal;
            }
            let state = Arc::clone(state);
            match tokio::task::spawn_blocking(move || state.registry.capture(pid)).await {
                Ok(result) => status_response(result.map(Some)),
                Err(e) => internal_error(e),
            }
        }

        DaemonRequest::ReleaseOrRebind { old_pid, new_pid } => {
            if let Some(refusal) = state.unavailable_if_shutting_down() {
                return refusal;
            }
            let state = Arc::clone(state);
            match tokio::task::spawn_blocking(move || {
                state.registry.release_or_rebind(old_pid, new_pid)
            })
            .await
            {
                Ok(result) => status_response(result),
                Err(e) => internal_error(e),
            }
        }
    }
}

fn internal_error(e: tokio::task::JoinError) -> DaemonResponse {
    tracing::error!(error = %e, "registry task failed");
    DaemonResponse::Error {
        code: DaemonErrorCode::Internal,
        message: format!("Registry task failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let config = Config::from_env();

    config
        .ensure_dirs()
        .context("Failed to create runtime directory")?;

    // Clean up stale socket if exists
    if config.socket_exists() {
        if config.is_daemon_running() {
            eprintln!("Daemon already running (PID: {:?})", config.read_pid());
            std::process::exit(1);
        }
        config
            .remove_socket()
            .context("Failed to remove stale socket")?;
    }

    config.write_pid().context("Failed to write PID file")?;

    let state = Arc::new(DaemonState::new());

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    // Owner-only access
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }

    tracing::info!(socket = %config.socket_path.display(), "daemon listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // SIGINT
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx_clone.send(()).await;
    });

    // SIGTERM
    let shutdown_tx_clone = shutdown_tx.clone();
    let mut sigterm = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        sigterm.recv().await;
        let _ = shutdown_tx_clone.send(()).await;
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(state, stream, shutdown_tx).await {
                                tracing::warn!(error = %e, "client error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                state.shutting_down.store(true, Ordering::SeqCst);
                tracing::info!("shutting down daemon");
                break;
            }
        }
    }

    let released = state.registry.release_all();
    config.remove_pid().ok();
    config.remove_socket().ok();

    tracing::info!(released, "daemon stopped");
    Ok(())
}
