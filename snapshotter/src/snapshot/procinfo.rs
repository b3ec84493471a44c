// Process-information lookup backed by procfs
//
// Every reader is best effort: a missing or unreadable field comes back as
// None rather than an error, and nothing here blocks on the target process.
// `inspect` falls back to sysinfo when procfs has nothing for the pid.

use crate::snapshot::protocol::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

const PROC_ROOT: &str = "/proc";

/// `PF_KTHREAD` from the kernel's task flags
const PF_KTHREAD: u64 = 0x0020_0000;

/// Kernel `comm` values are truncated to TASK_COMM_LEN - 1 bytes
pub const SHORT_NAME_MAX: usize = 15;

/// Relaunch metadata gathered from a live process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Kernel short name (`comm`)
    pub short_name: Option<String>,
    /// Resolved `/proc/<pid>/exe` target
    pub executable_path: Option<PathBuf>,
    /// Argument vector from `/proc/<pid>/cmdline`
    pub argument_vector: Option<Vec<String>>,
    /// Terminal device attached to stdin or stdout
    pub controlling_terminal: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
}

/// Coarse classification used by the registry eligibility rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// A genuine user-space program
    UserProgram,
    /// Kernel-owned thread (`PF_KTHREAD`)
    KernelThread,
    /// No user memory context (zombie, exiting, or kernel housekeeping)
    NoMemoryContext,
}

/// Fields of `/proc/<pid>/stat` the core cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFields {
    pub state: char,
    pub ppid: Pid,
    pub flags: u64,
}

impl StatFields {
    pub fn is_kernel_thread(&self) -> bool {
        self.flags & PF_KTHREAD != 0
    }

    /// Zombie or dead: the process has exited even if its id is still visible
    pub fn has_exited(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// One row of the operator process listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub pid: Pid,
    pub name: String,
    /// Heuristic: the process environment names an X11 or Wayland display
    pub gui: bool,
}

/// Gather everything needed to relaunch `pid` later
pub fn inspect(pid: Pid) -> ProcessInfo {
    #[cfg(target_os = "linux")]
    let from_proc = inspect_from_proc(pid);
    #[cfg(not(target_os = "linux"))]
    let from_proc = None;

    from_proc
        .or_else(|| inspect_from_sysinfo(pid))
        .unwrap_or(ProcessInfo {
            pid,
            ..ProcessInfo::default()
        })
}

#[cfg(target_os = "linux")]
fn inspect_from_proc(pid: Pid) -> Option<ProcessInfo> {
    // no comm means procfs cannot see the process at all
    let short_name = read_short_name(pid)?;
    Some(ProcessInfo {
        pid,
        short_name: Some(short_name),
        executable_path: read_executable(pid),
        argument_vector: read_argument_vector(pid),
        controlling_terminal: read_controlling_terminal(pid),
        working_directory: read_working_directory(pid),
    })
}

fn inspect_from_sysinfo(pid: Pid) -> Option<ProcessInfo> {
    let sys_pid = sysinfo::Pid::from_u32(u32::try_from(pid).ok().filter(|&p| p > 0)?);
    let refresh = ProcessRefreshKind::nothing()
        .with_cmd(UpdateKind::Always)
        .with_exe(UpdateKind::Always)
        .with_cwd(UpdateKind::Always);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[sys_pid]), true, refresh);
    let process = system.process(sys_pid)?;

    let name = process.name().to_string_lossy().into_owned();
    let argv: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    Some(ProcessInfo {
        pid,
        short_name: (!name.is_empty()).then_some(name),
        executable_path: process.exe().map(Path::to_path_buf),
        argument_vector: (!argv.is_empty()).then_some(argv),
        controlling_terminal: None,
        working_directory: process.cwd().map(Path::to_path_buf),
    })
}

pub fn read_short_name(pid: Pid) -> Option<String> {
    let raw = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let name = raw.trim_end_matches('\n');
    (!name.is_empty()).then(|| name.to_string())
}

pub fn read_executable(pid: Pid) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .filter(|p| !p.as_os_str().is_empty())
}

pub fn read_working_directory(pid: Pid) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/cwd")).ok()
}

pub fn read_argument_vector(pid: Pid) -> Option<Vec<String>> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    parse_cmdline(&raw)
}

/// Split a NUL-separated `cmdline` buffer into arguments
pub fn parse_cmdline(raw: &[u8]) -> Option<Vec<String>> {
    if raw.is_empty() {
        return None;
    }
    let body = raw.strip_suffix(b"\0").unwrap_or(raw);
    let args: Vec<String> = body
        .split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if args.iter().all(|a| a.is_empty()) {
        None
    } else {
        Some(args)
    }
}

/// Terminal attached to fd 0, else fd 1
pub fn read_controlling_terminal(pid: Pid) -> Option<PathBuf> {
    [0, 1]
        .iter()
        .filter_map(|fd| fs::read_link(format!("/proc/{pid}/fd/{fd}")).ok())
        .find(|target| is_terminal_path(target))
}

/// Whether a descriptor target names a terminal device
pub fn is_terminal_path(path: &Path) -> bool {
    let Some(text) = path.to_str() else {
        return false;
    };
    text.starts_with("/dev/pts/")
        || (text.starts_with("/dev/tty") && text.len() > "/dev/tty".len())
        || text == "/dev/console"
}

pub fn read_stat(pid: Pid) -> Option<StatFields> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&raw)
}

/// Parse `/proc/<pid>/stat`. The `comm` field may itself contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(raw: &str) -> Option<StatFields> {
    let after_comm = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // state ppid pgrp session tty_nr tpgid flags ...
    let state = fields.first()?.chars().next()?;
    let ppid = fields.get(1)?.parse().ok()?;
    let flags = fields.get(6)?.parse().ok()?;
    Some(StatFields { state, ppid, flags })
}

/// Real uid from `/proc/<pid>/status`
pub fn read_uid(pid: Pid) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_status_uid(&status)
}

fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Processes with a user address space report `VmSize` in their status file
fn has_user_memory(pid: Pid) -> bool {
    fs::read_to_string(format!("/proc/{pid}/status"))
        .map(|status| status.lines().any(|line| line.starts_with("VmSize:")))
        .unwrap_or(false)
}

/// Classify `pid`; None when it does not resolve to a process at all
pub fn classify(pid: Pid) -> Option<Eligibility> {
    if pid <= 0 {
        return None;
    }
    let stat = read_stat(pid)?;
    if stat.is_kernel_thread() {
        return Some(Eligibility::KernelThread);
    }
    if stat.has_exited() || !has_user_memory(pid) {
        return Some(Eligibility::NoMemoryContext);
    }
    Some(Eligibility::UserProgram)
}

/// Non-blocking liveness check; zombies count as exited
pub fn is_alive(pid: Pid) -> bool {
    pid > 0 && read_stat(pid).is_some_and(|stat| !stat.has_exited())
}

fn numeric_entries() -> Vec<Pid> {
    let Ok(dir) = fs::read_dir(PROC_ROOT) else {
        return Vec::new();
    };
    let mut pids: Vec<Pid> = dir
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<Pid>().ok())
        .collect();
    pids.sort_unstable();
    pids
}

/// Processes whose parent is `pid`
pub fn direct_children(pid: Pid) -> Vec<Pid> {
    numeric_entries()
        .into_iter()
        .filter(|&candidate| read_stat(candidate).is_some_and(|stat| stat.ppid == pid))
        .collect()
}

/// Snapshot of running processes for operator listings
pub fn list_processes() -> Vec<ProcessSummary> {
    numeric_entries()
        .into_iter()
        .filter_map(|pid| {
            let name = read_short_name(pid)?;
            Some(ProcessSummary {
                pid,
                name,
                gui: is_gui_process(pid),
            })
        })
        .collect()
}

fn is_gui_process(pid: Pid) -> bool {
    if let Ok(cmdline) = fs::read(format!("/proc/{pid}/cmdline")) {
        let text = String::from_utf8_lossy(&cmdline);
        // browser helper processes inherit DISPLAY but are not user-facing
        if text.contains("--type=renderer") || text.contains("--type=gpu-process") {
            return false;
        }
    }
    fs::read(format!("/proc/{pid}/environ"))
        .map(|environ| {
            environ
                .split(|b| *b == 0)
                .any(|var| var.starts_with(b"DISPLAY=") || var.starts_with(b"WAYLAND_DISPLAY="))
        })
        .unwrap_or(false)
}

/// Truncate a name the way the kernel truncates `comm`
pub fn kernel_short_name(name: &str) -> &str {
    if name.len() <= SHORT_NAME_MAX {
        return name;
    }
    let mut end = SHORT_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Block until a freshly spawned child has exec'd `program`. Until then it
/// still shows the parent's comm and cmdline.
#[cfg(test)]
pub(crate) fn wait_for_exec(pid: Pid, program: &str) {
    use std::time::{Duration, Instant};

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let argv = read_argument_vector(pid);
        if read_short_name(pid).as_deref() == Some(program)
            && argv.as_ref().and_then(|a| a.first()).map(String::as_str) == Some(program)
        {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("process {} never exec'd {}", pid, program);
}
