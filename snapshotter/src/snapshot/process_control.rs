// Process control: signals, liveness polling and bounded waits

use crate::snapshot::procinfo;
use crate::snapshot::protocol::Pid;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval used by the termination and exit waits
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for a SIGKILL to take effect before giving up
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);

/// How to start a program again: what to exec, with which arguments, where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchPlan {
    /// Pick the best program reference: argument vector, then executable
    /// path, then the bare display name. None when nothing usable is known.
    pub fn resolve(
        argument_vector: Option<&[String]>,
        executable_path: Option<&Path>,
        display_name: &str,
    ) -> Option<Self> {
        let (program, args) = match argument_vector {
            Some([first, rest @ ..]) if !first.is_empty() => (first.clone(), rest.to_vec()),
            _ => match executable_path {
                Some(path) if !path.as_os_str().is_empty() => {
                    (path.to_string_lossy().into_owned(), Vec::new())
                }
                _ if !display_name.trim().is_empty() => {
                    (display_name.trim().to_string(), Vec::new())
                }
                _ => return None,
            },
        };
        Some(Self {
            program,
            args,
            working_directory: None,
        })
    }

    pub fn with_working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.working_directory = dir;
        self
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Base command; the working directory is applied only if it still exists
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = self.working_directory.as_ref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Start `cmd` in a new session with stdio on the null device
pub fn spawn_detached(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
}

/// Reap `child` on a background thread so an untracked launch never lingers
/// as a zombie
pub fn reap_in_background(mut child: Child) {
    thread::spawn(move || {
        let _ = child.wait();
    });
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signal: Signal) -> nix::Result<()> {
    if pid <= 0 {
        return Err(Errno::ESRCH);
    }
    match kill(NixPid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Poll until `pid` has exited or `timeout` elapses. Returns true once it is gone.
pub fn wait_for_exit(pid: Pid, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !procinfo::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(interval);
    }
}

fn wait_for_all(pids: &[Pid], timeout: Duration) -> Vec<Pid> {
    let deadline = Instant::now() + timeout;
    loop {
        let survivors: Vec<Pid> = pids
            .iter()
            .copied()
            .filter(|&pid| procinfo::is_alive(pid))
            .collect();
        if survivors.is_empty() || Instant::now() >= deadline {
            return survivors;
        }
        thread::sleep(LIVENESS_POLL_INTERVAL);
    }
}

/// Result of terminating a process and its direct children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub pid: Pid,
    pub children: Vec<Pid>,
    /// SIGKILL was needed for at least one process
    pub forced: bool,
    /// Every signalled process is confirmed gone
    pub confirmed: bool,
}

/// SIGTERM `pid` and its direct children, escalating to SIGKILL for any that
/// survive `grace`.
pub fn terminate(pid: Pid, grace: Duration) -> Termination {
    let children = procinfo::direct_children(pid);
    let mut targets = children.clone();
    targets.push(pid);

    for &target in &targets {
        if let Err(err) = send_signal(target, Signal::SIGTERM) {
            tracing::warn!(pid = target, error = %err, "SIGTERM failed");
        }
    }

    let survivors = wait_for_all(&targets, grace);
    let forced = !survivors.is_empty();
    if forced {
        tracing::debug!(?survivors, "escalating to SIGKILL");
        for &target in &survivors {
            if let Err(err) = send_signal(target, Signal::SIGKILL) {
                tracing::warn!(pid = target, error = %err, "SIGKILL failed");
            }
        }
    }
    let confirmed = wait_for_all(&targets, KILL_CONFIRM_TIMEOUT).is_empty();

    Termination {
        pid,
        children,
        forced,
        confirmed,
    }
}

/// What a freshly spawned child did during a watch window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildWatch {
    Exited(ExitStatus),
    Alive,
}

/// Watch a spawned child for an early exit, polling `try_wait` every
/// `interval` for at most `window`.
pub fn watch_child(child: &mut Child, window: Duration, interval: Duration) -> ChildWatch {
    let deadline = Instant::now() + window;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return ChildWatch::Exited(status),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(pid = child.id(), error = %err, "try_wait failed");
            }
        }
        if Instant::now() >= deadline {
            return ChildWatch::Alive;
        }
        thread::sleep(interval);
    }
}

/// SIGKILL a spawned child and reap it
pub fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::debug!(pid = child.id(), error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        tracing::debug!(pid = child.id(), error = %err, "reap failed");
    }
}
