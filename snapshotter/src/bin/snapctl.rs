// snapctl: operator CLI for snapshotd
//
// Commands:
//   snapctl list
//   snapctl capture <pid>
//   snapctl restore <pid>
//   snapctl saved
//   snapctl slots
//   snapctl menu
//   snapctl ping | shutdown

use anyhow::{Context, Result};
use snapshotter_lib::{
    logging,
    snapshot::{
        capture::{CaptureAgent, CaptureError},
        config::{CaptureSettings, Config, RestoreSettings},
        daemon_client::DaemonClient,
        procinfo,
        protocol::Pid,
        restore::{RestoreError, RestoreOrchestrator, RestoreOutcome},
        saved::SavedStore,
    },
};
use std::env;
use std::io::{self, BufRead, Write};

fn print_help() {
    println!(
        r#"snapctl - snapshot a running program, terminate it, and relaunch it later

USAGE:
    snapctl <COMMAND> [ARGS]

COMMANDS:
    list                   List running processes (GUI hint included)
    capture <pid>          Snapshot a process and terminate it (alias: snapshot)
    restore <pid>          Relaunch a captured process in its old slot
    saved                  Show saved process records
    slots                  Show slots held by the daemon
    menu                   Interactive mode
    ping                   Check that the daemon is running
    shutdown               Stop the daemon (releases every slot)
    help                   Show this message

ENVIRONMENT:
    SNAPSHOT_DAEMON_DIR            Override runtime and state directories
    SNAPSHOT_TERM_GRACE_MS         Grace period before SIGKILL on capture
    SNAPSHOT_VALIDATION_WINDOW_MS  How long a relaunched program is watched
    SNAPSHOT_STRICT_VALIDATION=1   Reject relaunches that cannot be verified
    SNAPSHOT_NO_TERMINAL_EMULATOR=1  Never fall back to a terminal emulator
    RUST_LOG / SNAPSHOT_LOG_JSON   Diagnostic logging on stderr
"#
    );
}

struct Cli {
    client: DaemonClient,
    saved: SavedStore,
}

impl Cli {
    fn new() -> Self {
        let config = Config::from_env();
        let saved = SavedStore::new(&config);
        Self {
            client: DaemonClient::new(config).with_auto_start(true),
            saved,
        }
    }

    fn list_processes(&self) {
        let mut processes = procinfo::list_processes();
        processes.sort_by_key(|p| p.pid);
        println!("{:>7}  {:<16}  GUI", "PID", "NAME");
        for process in processes {
            println!(
                "{:>7}  {:<16}  {}",
                process.pid,
                process.name,
                if process.gui { "yes" } else { "" }
            );
        }
    }

    fn capture(&self, pid: Pid) -> Result<bool> {
        let agent = CaptureAgent::new(&self.client, &self.saved, CaptureSettings::from_env());
        match agent.capture(pid) {
            Ok(report) => {
                println!(
                    "Captured {} ({}) into slot {}",
                    pid, report.record.display_name, report.entry.slot_id
                );
                if report.termination.forced {
                    println!("Process ignored SIGTERM and was killed.");
                }
                if !report.termination.confirmed {
                    println!("Warning: process {} may still be running.", pid);
                }
                Ok(true)
            }
            Err(CaptureError::Refused { source, .. }) => {
                eprintln!("Capture refused: {}", source);
                Ok(false)
            }
            Err(err @ (CaptureError::SelfCapture | CaptureError::SavedTableFull(_))) => {
                eprintln!("{}", err);
                Ok(false)
            }
            Err(err) => Err(err).context("Capture failed"),
        }
    }

    fn restore(&self, slot_id: Pid) -> Result<bool> {
        let orchestrator =
            RestoreOrchestrator::new(&self.client, &self.saved, RestoreSettings::from_env());
        let report = match orchestrator.restore(slot_id) {
            Ok(report) => report,
            Err(RestoreError::NoRecord(slot)) => {
                eprintln!("No saved record for {}", slot);
                return Ok(false);
            }
            Err(err) => return Err(err).context("Restore failed"),
        };

        println!("{}", report.summary());
        for note in &report.notes {
            println!("  {}", note);
        }
        match report.outcome {
            RestoreOutcome::Committed { .. } if report.attached => {
                println!("Reattached to its terminal.");
            }
            RestoreOutcome::Committed { .. } => {
                println!("Running detached (terminal unavailable).");
            }
            _ => {}
        }
        Ok(report.is_committed())
    }

    fn show_saved(&self) -> Result<()> {
        let records = self.saved.load().context("Failed to read saved records")?;
        if records.is_empty() {
            println!("No saved processes.");
            return Ok(());
        }
        for record in records {
            println!("{}  {}", record.slot_id, record.display_name);
            if let Some(exe) = &record.executable_path {
                println!("    exe:  {}", exe.display());
            }
            if let Some(argv) = &record.argument_vector {
                println!("    argv: {}", argv.join(" "));
            }
            if let Some(tty) = &record.controlling_terminal_path {
                println!("    tty:  {}", tty.display());
            }
            if let Some(cwd) = &record.working_directory {
                println!("    cwd:  {}", cwd.display());
            }
            println!("    saved {}", record.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Ok(())
    }

    fn show_slots(&self) -> Result<()> {
        let entries = self.client.list().context("Failed to list slots")?;
        if entries.is_empty() {
            println!("No slots held.");
            return Ok(());
        }
        println!("{:>7}  {:<16}  {:>6}  CAPTURED", "SLOT", "NAME", "UID");
        for entry in entries {
            let uid = entry
                .owner_uid
                .map(|uid| uid.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:>7}  {:<16}  {:>6}  {}",
                entry.slot_id,
                entry.display_name,
                uid,
                entry.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Ok(())
    }

    fn menu(&self) -> Result<()> {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        run_menu(&mut lines, |action| match action {
            MenuAction::ListProcesses => {
                self.list_processes();
                Ok(())
            }
            MenuAction::Capture(pid) => self.capture(pid).map(drop),
            MenuAction::ShowSaved => self.show_saved(),
            MenuAction::Restore(pid) => self.restore(pid).map(drop),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuAction {
    ListProcesses,
    Capture(Pid),
    ShowSaved,
    Restore(Pid),
}

/// Interactive loop. A failed action is reported and the menu keeps going;
/// only end of input or "Exit" leaves it.
fn run_menu(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    mut act: impl FnMut(MenuAction) -> Result<()>,
) -> Result<()> {
    let mut run = |action| {
        if let Err(err) = act(action) {
            eprintln!("Error: {:#}", err);
        }
    };

    loop {
        println!();
        println!("1) Snapshot & kill a process");
        println!("2) Restore a process");
        println!("3) Show saved processes");
        println!("4) Exit");
        let Some(choice) = prompt(lines, "Choice: ")? else {
            return Ok(());
        };

        match choice.as_str() {
            "1" => {
                run(MenuAction::ListProcesses);
                if let Some(pid) = prompt_pid(lines, "PID to snapshot: ")? {
                    run(MenuAction::Capture(pid));
                }
            }
            "2" => {
                run(MenuAction::ShowSaved);
                if let Some(pid) = prompt_pid(lines, "PID to restore: ")? {
                    run(MenuAction::Restore(pid));
                }
            }
            "3" => run(MenuAction::ShowSaved),
            "4" => return Ok(()),
            other => println!("Unknown choice: {}", other),
        }
    }
}

fn prompt(lines: &mut impl Iterator<Item = io::Result<String>>, text: &str) -> Result<Option<String>> {
    print!("{}", text);
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_string())),
        None => Ok(None),
    }
}

fn prompt_pid(lines: &mut impl Iterator<Item = io::Result<String>>, text: &str) -> Result<Option<Pid>> {
    let Some(answer) = prompt(lines, text)? else {
        return Ok(None);
    };
    match parse_pid(&answer) {
        Ok(pid) => Ok(Some(pid)),
        Err(err) => {
            println!("{}", err);
            Ok(None)
        }
    }
}

fn parse_pid(text: &str) -> Result<Pid> {
    let pid: Pid = text
        .parse()
        .with_context(|| format!("Invalid PID: {}", text))?;
    if pid <= 0 {
        anyhow::bail!("Invalid PID: {}", text);
    }
    Ok(pid)
}

fn pid_arg(args: &[String], usage: &str) -> Pid {
    let Some(raw) = args.get(2) else {
        eprintln!("Usage: {}", usage);
        std::process::exit(1);
    };
    match parse_pid(raw) {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}

fn main() -> Result<()> {
    logging::init("warn");

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cli = Cli::new();
    let command = args[1].as_str();

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }

        "list" => {
            cli.list_processes();
            Ok(())
        }

        "capture" | "snapshot" => {
            let pid = pid_arg(&args, "snapctl capture <pid>");
            if !cli.capture(pid)? {
                std::process::exit(1);
            }
            Ok(())
        }

        "restore" => {
            let pid = pid_arg(&args, "snapctl restore <pid>");
            if !cli.restore(pid)? {
                std::process::exit(1);
            }
            Ok(())
        }

        "saved" => cli.show_saved(),

        "slots" => cli.show_slots(),

        "menu" => cli.menu(),

        "ping" => {
            cli.client.ping().context("Daemon did not answer")?;
            println!("Daemon is running.");
            Ok(())
        }

        "shutdown" => {
            let client = DaemonClient::new(cli.client.config().clone());
            client.shutdown().context("Failed to stop daemon")?;
            println!("Daemon stopped.");
            Ok(())
        }

        _ => {
            eprintln!("Unknown command: {}", command);
            print_help();
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234").unwrap(), 1234);
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("-5").is_err());
        assert!(parse_pid("vim").is_err());
    }

    #[test]
    fn test_prompt_reads_trimmed_lines_until_eof() {
        let mut lines = vec![Ok("  42 \n".to_string())].into_iter();
        assert_eq!(
            prompt_pid(&mut lines, "").unwrap(),
            Some(42)
        );
        assert_eq!(prompt(&mut lines, "").unwrap(), None);
    }

    #[test]
    fn test_menu_keeps_running_after_failed_action() {
        let input = ["1", "42", "2", "7", "9", "3", "4", "1"];
        let mut lines = input.iter().map(|line| Ok(line.to_string()));
        let mut performed = Vec::new();

        run_menu(&mut lines, |action| {
            performed.push(action);
            match action {
                MenuAction::Capture(_) => Err(anyhow::anyhow!("daemon unavailable")),
                _ => Ok(()),
            }
        })
        .unwrap();

        assert_eq!(
            performed,
            vec![
                MenuAction::ListProcesses,
                MenuAction::Capture(42),
                MenuAction::ShowSaved,
                MenuAction::Restore(7),
                MenuAction::ShowSaved,
            ]
        );
        // "Exit" stops before the trailing input is read
        assert_eq!(lines.next().map(|line| line.unwrap()), Some("1".to_string()));
    }

    #[test]
    fn test_menu_ends_at_end_of_input() {
        let mut lines = std::iter::empty();
        let mut performed = Vec::new();
        run_menu(&mut lines, |action| {
            performed.push(action);
            Ok(())
        })
        .unwrap();
        assert!(performed.is_empty());
    }
}
