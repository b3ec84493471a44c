// Daemon client
// Talks to snapshotd over its Unix socket. Each request opens a connection,
// performs the version handshake, sends one frame and reads one frame back.

use crate::snapshot::config::Config;
use crate::snapshot::control::{ProcessTable, RegistryControl, RegistryError};
use crate::snapshot::protocol::{
    deserialize_message, serialize_message, DaemonErrorCode, DaemonRequest, DaemonResponse,
    EntryView, Pid, SlotId, MAX_RESPONSE_FRAME_SIZE, PROTOCOL_VERSION,
};
use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

const DAEMON_BINARY: &str = "snapshotd";
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure to get an answer from the registry, or a refusal from it
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The registry processed the request and refused it
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    #[error("daemon error ({code:?}): {message}")]
    Protocol {
        code: DaemonErrorCode,
        message: String,
    },
    #[error("unexpected response from daemon: {0}")]
    Unexpected(String),
}

impl ChannelError {
    pub fn registry_error(&self) -> Option<&RegistryError> {
        match self {
            ChannelError::Registry(err) => Some(err),
            _ => None,
        }
    }
}

/// The two registry operations, as seen by the capture and restore sides
pub trait RegistryChannel {
    fn capture(&self, pid: Pid) -> Result<EntryView, ChannelError>;

    /// `new_pid == 0` releases the slot
    fn release_or_rebind(
        &self,
        old_pid: SlotId,
        new_pid: Pid,
    ) -> Result<Option<EntryView>, ChannelError>;
}

impl<T: ProcessTable> RegistryChannel for RegistryControl<T> {
    fn capture(&self, pid: Pid) -> Result<EntryView, ChannelError> {
        Ok(RegistryControl::capture(self, pid)?)
    }

    fn release_or_rebind(
        &self,
        old_pid: SlotId,
        new_pid: Pid,
    ) -> Result<Option<EntryView>, ChannelError> {
        Ok(RegistryControl::release_or_rebind(self, old_pid, new_pid)?)
    }
}

/// Client for the registry daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    config: Config,
    auto_start: bool,
}

impl DaemonClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            auto_start: false,
        }
    }

    /// Start the daemon on first use if it is not running
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = match UnixStream::connect(&self.config.socket_path) {
            Ok(stream) => stream,
            Err(err) if self.auto_start => {
                tracing::debug!(error = %err, "daemon not reachable, starting it");
                start_daemon(&self.config)?
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "Failed to connect to daemon at {}",
                        self.config.socket_path.display()
                    )
                })
            }
        };
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(stream)
    }

    /// Send one request and return the daemon's answer, handshake included
    pub fn send(&self, request: &DaemonRequest) -> Result<DaemonResponse, ChannelError> {
        let stream = self
            .connect()
            .map_err(|e| ChannelError::Unavailable(format!("{:#}", e)))?;
        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| ChannelError::Unavailable(e.to_string()))?,
        );
        let mut writer = stream;

        let handshake = DaemonRequest::Handshake {
            client_version: PROTOCOL_VERSION,
        };
        match exchange(&mut writer, &mut reader, &handshake)? {
            DaemonResponse::Handshake { .. } => {}
            DaemonResponse::Error { code, message } => {
                return Err(ChannelError::Protocol { code, message })
            }
            other => return Err(ChannelError::Unexpected(format!("{:?}", other))),
        }

        match exchange(&mut writer, &mut reader, request)? {
            DaemonResponse::Error { code, message } => Err(ChannelError::Protocol { code, message }),
            response => Ok(response),
        }
    }

    pub fn ping(&self) -> Result<(), ChannelError> {
        match self.send(&DaemonRequest::Ping)? {
            DaemonResponse::Pong => Ok(()),
            other => Err(ChannelError::Unexpected(format!("{:?}", other))),
        }
    }

    pub fn list(&self) -> Result<Vec<EntryView>, ChannelError> {
        match self.send(&DaemonRequest::List)? {
            DaemonResponse::Entries { entries } => Ok(entries),
            other => Err(ChannelError::Unexpected(format!("{:?}", other))),
        }
    }

    pub fn shutdown(&self) -> Result<(), ChannelError> {
        match self.send(&DaemonRequest::Shutdown)? {
            DaemonResponse::ShuttingDown => Ok(()),
            other => Err(ChannelError::Unexpected(format!("{:?}", other))),
        }
    }

    fn status_request(
        &self,
        request: &DaemonRequest,
        slot: SlotId,
        pid: Pid,
    ) -> Result<Option<EntryView>, ChannelError> {
        match self.send(request)? {
            DaemonResponse::Status {
                code,
                message,
                entry,
            } => match RegistryError::from_status(code, slot, pid, message) {
                Some(err) => Err(err.into()),
                None => Ok(entry),
            },
            other => Err(ChannelError::Unexpected(format!("{:?}", other))),
        }
    }
}

impl RegistryChannel for DaemonClient {
    fn capture(&self, pid: Pid) -> Result<EntryView, ChannelError> {
        self.status_request(&DaemonRequest::Capture { pid }, pid, pid)?
            .ok_or_else(|| ChannelError::Unexpected("capture succeeded without an entry".into()))
    }

    fn release_or_rebind(
        &self,
        old_pid: SlotId,
        new_pid: Pid,
    ) -> Result<Option<EntryView>, ChannelError> {
        self.status_request(
            &DaemonRequest::ReleaseOrRebind { old_pid, new_pid },
            old_pid,
            new_pid,
        )
    }
}

fn exchange(
    writer: &mut UnixStream,
    reader: &mut BufReader<UnixStream>,
    request: &DaemonRequest,
) -> Result<DaemonResponse, ChannelError> {
    let bytes = serialize_message(request)
        .map_err(|e| ChannelError::Unexpected(format!("Failed to serialize request: {}", e)))?;
    writer
        .write_all(&bytes)
        .and_then(|_| writer.flush())
        .map_err(|e| ChannelError::Unavailable(format!("Failed to send request: {}", e)))?;
    read_response(reader)
}

/// Read one response frame, enforcing the frame size limit
fn read_response(reader: &mut BufReader<UnixStream>) -> Result<DaemonResponse, ChannelError> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => {
            return Err(ChannelError::Unavailable(
                "Daemon closed connection unexpectedly".to_string(),
            ))
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut
            || e.kind() == std::io::ErrorKind::WouldBlock =>
        {
            return Err(ChannelError::Protocol {
                code: DaemonErrorCode::Timeout,
                message: "Daemon read timeout".to_string(),
            })
        }
        Err(e) => {
            return Err(ChannelError::Unavailable(format!(
                "Failed to read response from daemon: {}",
                e
            )))
        }
    }

    if line.len() > MAX_RESPONSE_FRAME_SIZE {
        return Err(ChannelError::Protocol {
            code: DaemonErrorCode::Internal,
            message: format!(
                "Response frame too large: {} bytes (max {})",
                line.len(),
                MAX_RESPONSE_FRAME_SIZE
            ),
        });
    }

    deserialize_message(line.as_bytes()).map_err(|e| {
        ChannelError::Unexpected(format!(
            "Failed to parse daemon response: {} (line: {})",
            e,
            line.trim()
        ))
    })
}

/// Locate the daemon binary: next to the current executable, then on $PATH
pub fn resolve_daemon_path() -> Option<PathBuf> {
    if let Some(sibling) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
        .filter(|path| path.is_file())
    {
        return Some(sibling);
    }
    which::which(DAEMON_BINARY).ok()
}

fn start_daemon(config: &Config) -> Result<UnixStream> {
    let daemon_path = resolve_daemon_path()
        .ok_or_else(|| anyhow!("Could not find the {} binary", DAEMON_BINARY))?;

    // The daemon inherits our environment, so it resolves the same Config
    Command::new(&daemon_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start daemon at {}", daemon_path.display()))?;

    // Wait for the socket to appear (up to 5 seconds)
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(stream) = UnixStream::connect(&config.socket_path) {
            tracing::info!(path = %daemon_path.display(), "daemon started");
            return Ok(stream);
        }
    }

    Err(anyhow!(
        "Daemon did not start within 5 seconds (socket not found at: {})",
        config.socket_path.display()
    ))
}
