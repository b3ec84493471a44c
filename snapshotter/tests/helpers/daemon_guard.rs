use super::polling::{poll_until, wait_for_file_content, WaitError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use snapshotter_lib::snapshot::config::{Config, DAEMON_DIR_ENV};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs the built snapshotd in a private directory and stops it on drop
pub struct DaemonGuard {
    child: Child,
    config: Config,
}

impl DaemonGuard {
    pub fn start(data_dir: &Path) -> Result<Self, DaemonError> {
        let daemon_bin = PathBuf::from(env!("CARGO_BIN_EXE_snapshotd"));
        if !daemon_bin.exists() {
            return Err(DaemonError::BinaryNotFound(daemon_bin));
        }

        let child = Command::new(&daemon_bin)
            .env(DAEMON_DIR_ENV, data_dir)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            config: Config::in_dir(data_dir),
        };
        guard.wait_for_ready().map_err(DaemonError::ReadyTimeout)?;
        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn wait_for_ready(&self) -> Result<(), WaitError> {
        wait_for_file_content(
            &self.config.pid_file,
            |content| content.trim().parse::<u32>().is_ok(),
            READY_TIMEOUT,
        )?;
        let socket = self.config.socket_path.clone();
        poll_until("daemon socket", READY_TIMEOUT, || socket.exists().then_some(()))
    }

    /// Wait for the daemon to exit on its own (after a shutdown request)
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let child = &mut self.child;
        poll_until("daemon exit", timeout, || child.try_wait().ok().flatten()).is_ok()
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        // SIGTERM first so the daemon releases its slots and removes the socket
        let pid = NixPid::from_raw(self.child.id() as i32);
        if kill(pid, Signal::SIGTERM).is_ok() && self.wait_for_exit(STOP_TIMEOUT) {
            return;
        }

        if let Err(err) = self.child.kill() {
            eprintln!("Failed to kill snapshotd pid {}: {}", self.child.id(), err);
            return;
        }
        let _ = self.child.wait();
    }
}

#[derive(Debug)]
pub enum DaemonError {
    BinaryNotFound(PathBuf),
    SpawnFailed(std::io::Error),
    ReadyTimeout(WaitError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryNotFound(path) => {
                write!(f, "snapshotd binary not found at {}", path.display())
            }
            Self::SpawnFailed(err) => write!(f, "failed to spawn daemon: {}", err),
            Self::ReadyTimeout(err) => write!(f, "daemon never became ready: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}
