// Environment configuration helpers for the registry daemon and CLI
// Handles platform-specific paths for the socket, PID file, and saved records

use std::path::PathBuf;
use std::time::Duration;

/// Overrides both the runtime and state directories
pub const DAEMON_DIR_ENV: &str = "SNAPSHOT_DAEMON_DIR";

const VALIDATION_WINDOW_ENV: &str = "SNAPSHOT_VALIDATION_WINDOW_MS";
const TERM_GRACE_ENV: &str = "SNAPSHOT_TERM_GRACE_MS";
const STRICT_VALIDATION_ENV: &str = "SNAPSHOT_STRICT_VALIDATION";
const NO_TERMINAL_EMULATOR_ENV: &str = "SNAPSHOT_NO_TERMINAL_EMULATOR";

/// Default time a respawned candidate must survive before it is validated
const DEFAULT_VALIDATION_WINDOW: Duration = Duration::from_millis(500);

/// Interval between liveness polls inside the validation window
const VALIDATION_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default grace period between SIGTERM and SIGKILL when terminating a capture target
const DEFAULT_TERM_GRACE: Duration = Duration::from_millis(1000);

/// Configuration for daemon paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for storing runtime files (socket, PID)
    pub runtime_dir: PathBuf,
    /// Directory for storing persistent state (saved.json)
    pub state_dir: PathBuf,
    /// Path to the control socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        let runtime_dir = Self::default_runtime_dir();
        let state_dir = Self::default_state_dir();

        Self {
            socket_path: runtime_dir.join("snapshotd.sock"),
            pid_file: runtime_dir.join("snapshotd.pid"),
            runtime_dir,
            state_dir,
        }
    }

    /// Create configuration rooted at a single directory
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            socket_path: base.join("snapshotd.sock"),
            pid_file: base.join("snapshotd.pid"),
            runtime_dir: base.clone(),
            state_dir: base,
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        match std::env::var(DAEMON_DIR_ENV) {
            Ok(override_dir) if !override_dir.trim().is_empty() => Self::in_dir(override_dir),
            _ => Self::default_paths(),
        }
    }

    fn default_runtime_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set, else fall back to state_dir
            if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                return PathBuf::from(runtime_dir).join("snapshotter");
            }
        }

        Self::default_state_dir()
    }

    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".snapshotter"))
            .unwrap_or_else(|| PathBuf::from("/tmp/snapshotter"))
    }

    /// Get the runtime directory (socket + pid)
    pub fn runtime_dir(&self) -> &PathBuf {
        &self.runtime_dir
    }

    /// Get the state directory (saved records)
    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Get the saved.json file path
    pub fn saved_file(&self) -> PathBuf {
        self.state_dir.join("saved.json")
    }

    /// Ensure both runtime and state directories exist with appropriate permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }

    /// Check if the daemon socket exists (indicating daemon may be running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if a process with the stored PID is still running
    pub fn is_daemon_running(&self) -> bool {
        match self.read_pid() {
            Some(pid) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok(),
            None => false,
        }
    }
}

/// How to treat a candidate when neither side has identity fields to compare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// Accept the candidate (behaviour of the original tool)
    Permissive,
    /// Reject the candidate
    Strict,
}

/// Tunables for the restore orchestrator
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// How long a fresh candidate is watched for an early exit
    pub validation_window: Duration,
    /// Interval between liveness polls inside the window
    pub poll_interval: Duration,
    pub validation_policy: ValidationPolicy,
    /// Whether to try terminal emulators when reattachment fails
    pub terminal_fallback: bool,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            validation_window: DEFAULT_VALIDATION_WINDOW,
            poll_interval: VALIDATION_POLL_INTERVAL,
            validation_policy: ValidationPolicy::Permissive,
            terminal_fallback: true,
        }
    }
}

impl RestoreSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(window) = duration_ms_from_env(VALIDATION_WINDOW_ENV) {
            settings.validation_window = window;
        }
        if flag_from_env(STRICT_VALIDATION_ENV) {
            settings.validation_policy = ValidationPolicy::Strict;
        }
        if flag_from_env(NO_TERMINAL_EMULATOR_ENV) {
            settings.terminal_fallback = false;
        }
        settings
    }
}

/// Tunables for the capture agent
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Grace period between SIGTERM and SIGKILL
    pub term_grace: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            term_grace: DEFAULT_TERM_GRACE,
        }
    }
}

impl CaptureSettings {
    pub fn from_env() -> Self {
        Self {
            term_grace: duration_ms_from_env(TERM_GRACE_ENV).unwrap_or(DEFAULT_TERM_GRACE),
        }
    }
}

fn duration_ms_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn flag_from_env(key: &str) -> bool {
    matches!(
        std::env::var(key),
        Ok(value) if value == "1" || value.eq_ignore_ascii_case("true")
    )
}
