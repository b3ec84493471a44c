// Terminal control: reattaching a relaunched program to its old terminal,
// and handing it to a terminal emulator when that is not possible.

use crate::snapshot::process_control::{self, LaunchPlan};
use std::ffi::{CStr, CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

/// How an emulator expects the program it should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgStyle {
    /// `<flag...> program arg...`
    Separate(&'static [&'static str]),
    /// `<flag> "program arg..."` as a single word
    Joined(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalEmulator {
    pub program: &'static str,
    pub style: ArgStyle,
}

/// Search order for the fallback launch
pub const EMULATORS: &[TerminalEmulator] = &[
    TerminalEmulator {
        program: "terminator",
        style: ArgStyle::Separate(&["-x"]),
    },
    TerminalEmulator {
        program: "x-terminal-emulator",
        style: ArgStyle::Separate(&["-e"]),
    },
    TerminalEmulator {
        program: "gnome-terminal",
        style: ArgStyle::Separate(&["--"]),
    },
    TerminalEmulator {
        program: "konsole",
        style: ArgStyle::Separate(&["-e"]),
    },
    TerminalEmulator {
        program: "xfce4-terminal",
        style: ArgStyle::Joined("-e"),
    },
    TerminalEmulator {
        program: "lxterminal",
        style: ArgStyle::Separate(&["-e"]),
    },
    TerminalEmulator {
        program: "urxvt",
        style: ArgStyle::Separate(&["-e"]),
    },
    TerminalEmulator {
        program: "xterm",
        style: ArgStyle::Separate(&["-hold", "-e"]),
    },
];

impl TerminalEmulator {
    /// Arguments that make this emulator run `argv`
    pub fn arguments(&self, argv: &[String]) -> Vec<String> {
        match self.style {
            ArgStyle::Separate(flags) => flags
                .iter()
                .map(|f| f.to_string())
                .chain(argv.iter().cloned())
                .collect(),
            ArgStyle::Joined(flag) => vec![flag.to_string(), argv.join(" ")],
        }
    }
}

/// First emulator from [`EMULATORS`] found on `search_path` (or `$PATH`)
pub fn find_emulator(search_path: Option<OsString>) -> Option<(TerminalEmulator, PathBuf)> {
    EMULATORS.iter().find_map(|emulator| {
        let found = match &search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(emulator.program, Some(paths), cwd)
            }
            None => which::which(emulator.program),
        };
        found.ok().map(|path| (*emulator, path))
    })
}

/// Run `plan` inside the first available terminal emulator. The launch is
/// not tracked. Returns the emulator used, or None when none could start it.
pub fn launch_in_emulator(plan: &LaunchPlan, search_path: Option<OsString>) -> Option<String> {
    let (emulator, path) = find_emulator(search_path)?;

    let mut cmd = Command::new(&path);
    cmd.args(emulator.arguments(&plan.argv()));
    if let Some(dir) = plan.working_directory.as_ref().filter(|d| d.is_dir()) {
        cmd.current_dir(dir);
    }

    match process_control::spawn_detached(cmd) {
        Ok(child) => {
            tracing::info!(
                emulator = emulator.program,
                program = %plan.program,
                "handed program to terminal emulator"
            );
            process_control::reap_in_background(child);
            Some(emulator.program.to_string())
        }
        Err(err) => {
            tracing::warn!(emulator = emulator.program, error = %err, "emulator launch failed");
            None
        }
    }
}

/// Launch `plan` as the session leader and foreground job of `terminal`,
/// with stdio on that terminal. Any failed step fails the spawn, so no
/// half-attached process is left behind.
pub fn spawn_attached(plan: &LaunchPlan, terminal: &Path) -> io::Result<Child> {
    let device = CString::new(terminal.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let mut cmd = plan.command();
    // SAFETY: the hook only calls async-signal-safe libc functions on
    // memory prepared before the fork.
    unsafe {
        cmd.pre_exec(move || attach_to_terminal(&device));
    }
    cmd.spawn()
}

fn attach_to_terminal(device: &CStr) -> io::Result<()> {
    // SAFETY: plain syscalls on descriptors owned by the forked child.
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }

        let fd = libc::open(device.as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // tcsetpgrp from a background group raises SIGTTOU
        let previous = libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        let mut claimed = libc::tcsetpgrp(fd, libc::getpgrp());
        if claimed < 0 {
            // not our controlling terminal yet
            libc::ioctl(fd, libc::TIOCSCTTY, 0);
            claimed = libc::tcsetpgrp(fd, libc::getpgrp());
        }
        let claim_error = io::Error::last_os_error();
        libc::signal(libc::SIGTTOU, previous);
        if claimed < 0 {
            return Err(claim_error);
        }

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(fd, target) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_executable(dir: &Path, name: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_emulator_argument_conventions() {
        let program = argv(&["vim", "notes.txt"]);
        let by_name = |name: &str| *EMULATORS.iter().find(|e| e.program == name).unwrap();

        assert_eq!(
            by_name("terminator").arguments(&program),
            argv(&["-x", "vim", "notes.txt"])
        );
        assert_eq!(
            by_name("gnome-terminal").arguments(&program),
            argv(&["--", "vim", "notes.txt"])
        );
        assert_eq!(
            by_name("xfce4-terminal").arguments(&program),
            argv(&["-e", "vim notes.txt"])
        );
        assert_eq!(
            by_name("xterm").arguments(&program),
            argv(&["-hold", "-e", "vim", "notes.txt"])
        );
    }

    #[test]
    fn test_find_emulator_follows_priority_order() {
        let dir = TempDir::new().unwrap();
        fake_executable(dir.path(), "xterm");
        fake_executable(dir.path(), "konsole");

        let (emulator, path) = find_emulator(Some(dir.path().as_os_str().to_owned())).unwrap();
        assert_eq!(emulator.program, "konsole");
        assert_eq!(path, dir.path().join("konsole"));
    }

    #[test]
    fn test_no_emulator_on_empty_path() {
        let dir = TempDir::new().unwrap();
        assert!(find_emulator(Some(dir.path().as_os_str().to_owned())).is_none());

        let plan = LaunchPlan::resolve(Some(&argv(&["true"])), None, "true").unwrap();
        assert!(launch_in_emulator(&plan, Some(dir.path().as_os_str().to_owned())).is_none());
    }

    #[test]
    fn test_launch_in_emulator_uses_found_program() {
        let dir = TempDir::new().unwrap();
        fake_executable(dir.path(), "urxvt");

        let plan = LaunchPlan::resolve(Some(&argv(&["true"])), None, "true").unwrap();
        let used = launch_in_emulator(&plan, Some(dir.path().as_os_str().to_owned()));
        assert_eq!(used.as_deref(), Some("urxvt"));
    }

    #[test]
    fn test_attach_to_missing_terminal_fails_spawn() {
        let plan = LaunchPlan::resolve(Some(&argv(&["sleep", "30"])), None, "sleep").unwrap();
        let result = spawn_attached(&plan, Path::new("/dev/pts/does-not-exist"));
        assert!(result.is_err());
    }
}
