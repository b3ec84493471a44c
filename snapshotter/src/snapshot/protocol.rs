// Control channel protocol - shared structs for daemon <-> CLI communication
// Uses framed JSON messages over Unix sockets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process identifier as seen by the kernel (`pid_t`)
pub type Pid = i32;

/// Registry key: the process id at capture time (or after the last rebind)
pub type SlotId = Pid;

/// Wire value of `new_pid` meaning "release, do not rebind"
pub const RELEASE_SENTINEL: Pid = 0;

/// Version of the control protocol, checked during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest request frame the daemon will parse (64 KiB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 64 * 1024;

/// Largest response frame a client will accept (1 MiB)
pub const MAX_RESPONSE_FRAME_SIZE: usize = 1024 * 1024;

/// Signed status of a registry operation: 0 on success, negative errno-style
/// code for each failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum StatusCode {
    Ok,
    NoSuchSlot,
    NoSuchProcess,
    HoldFailed,
    TableFull,
    AlreadyTracked,
    NotEligible,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::NoSuchSlot => -libc::ENOENT,
            StatusCode::NoSuchProcess => -libc::ESRCH,
            StatusCode::HoldFailed => -libc::EIO,
            StatusCode::TableFull => -libc::ENOMEM,
            StatusCode::AlreadyTracked => -libc::EEXIST,
            StatusCode::NotEligible => -libc::EINVAL,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            StatusCode::Ok,
            StatusCode::NoSuchSlot,
            StatusCode::NoSuchProcess,
            StatusCode::HoldFailed,
            StatusCode::TableFull,
            StatusCode::AlreadyTracked,
            StatusCode::NotEligible,
        ]
        .into_iter()
        .find(|status| status.code() == code)
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> i32 {
        status.code()
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        StatusCode::from_code(code).ok_or_else(|| format!("Unknown status code: {}", code))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "ok"),
            StatusCode::NoSuchSlot => write!(f, "no such slot"),
            StatusCode::NoSuchProcess => write!(f, "no such process"),
            StatusCode::HoldFailed => write!(f, "could not hold process reference"),
            StatusCode::TableFull => write!(f, "snapshot table full"),
            StatusCode::AlreadyTracked => write!(f, "process already tracked"),
            StatusCode::NotEligible => write!(f, "not a user-space program"),
        }
    }
}

/// Read-only view of one registry slot, for operator listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub slot_id: SlotId,
    /// Real uid of the tracked process (audit only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uid: Option<u32>,
    /// Short process name (kernel `comm`), best effort
    pub display_name: String,
    /// When the slot was created or last rebound
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// Client -> Daemon requests
// ============================================================================

/// Request message from CLI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Version negotiation, sent once per connection before anything else
    Handshake { client_version: u32 },
    /// Record a live user process in a new slot and hold a reference to it
    Capture { pid: Pid },
    /// Drop a slot (`new_pid == 0`) or move it onto a replacement process
    ReleaseOrRebind { old_pid: Pid, new_pid: Pid },
    /// List the current slots
    List,
    /// Ping to check if daemon is alive
    Ping,
    /// Request daemon to shut down gracefully
    Shutdown,
}

// ============================================================================
// Daemon -> Client responses
// ============================================================================

/// Transport-level error categories (registry failures travel as `Status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonErrorCode {
    InvalidRequest,
    VersionMismatch,
    Internal,
    /// Shutdown was requested; registry changes are no longer accepted
    DaemonUnavailable,
    Timeout,
}

/// Response message from daemon to CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// Handshake accepted
    Handshake { protocol_version: u32 },
    /// Outcome of a capture or release/rebind
    Status {
        code: StatusCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Slot state after a successful capture or rebind
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry: Option<EntryView>,
    },
    /// Current slots
    Entries { entries: Vec<EntryView> },
    /// Pong response
    Pong,
    /// Shutdown acknowledged
    ShuttingDown,
    /// Transport or protocol error
    Error {
        code: DaemonErrorCode,
        message: String,
    },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
