// Restore orchestrator
//
// Drives one saved slot through
//   Spawning -> AttachingTerminal -> LaunchingFallback -> Validating
//     -> Committing | RollingBack -> Done
// Every path ends in a rebind or a release of the slot, and the saved record
// is removed either way. The registry stays the source of truth.

use crate::snapshot::config::{RestoreSettings, ValidationPolicy};
use crate::snapshot::daemon_client::RegistryChannel;
use crate::snapshot::procinfo;
use crate::snapshot::process_control::{self, ChildWatch, LaunchPlan};
use crate::snapshot::protocol::{Pid, SlotId, RELEASE_SENTINEL};
use crate::snapshot::saved::{SavedProcessRecord, SavedStore, SavedStoreError};
use crate::snapshot::terminal;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Spawning,
    AttachingTerminal,
    LaunchingFallback,
    Validating,
    Committing,
    RollingBack,
    Done,
}

/// Why a slot was released instead of rebound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// The record names no program to launch
    NoProgram,
    LaunchFailed(String),
    /// The program was started inside a terminal emulator, outside the slot
    HandedOffToTerminal(String),
    /// The candidate exited inside the validation window
    SpawnFailed { exit_code: Option<i32> },
    ValidationMismatch { expected: String, found: String },
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackReason::NoProgram => write!(f, "no program to launch"),
            RollbackReason::LaunchFailed(err) => write!(f, "launch failed: {}", err),
            RollbackReason::HandedOffToTerminal(emulator) => {
                write!(f, "launched in {} outside the tracked slot", emulator)
            }
            RollbackReason::SpawnFailed {
                exit_code: Some(code),
            } => write!(f, "spawn failed (exit code {})", code),
            RollbackReason::SpawnFailed { exit_code: None } => {
                write!(f, "spawn failed (terminated by signal)")
            }
            RollbackReason::ValidationMismatch { expected, found } => {
                write!(f, "validation mismatch: expected {}, found {}", expected, found)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The slot now tracks `new_pid`
    Committed { new_pid: Pid },
    /// A validated candidate is running but the registry refused the rebind
    CommitFailed { new_pid: Pid, error: String },
    /// The slot was released
    RolledBack {
        reason: RollbackReason,
        release_error: Option<String>,
    },
}

/// What a restore did, for the operator
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub slot_id: SlotId,
    pub display_name: String,
    pub outcome: RestoreOutcome,
    /// Phases in the order they were entered
    pub phases: Vec<RestorePhase>,
    /// The candidate was started on its saved terminal
    pub attached: bool,
    pub notes: Vec<String>,
}

impl RestoreReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, RestoreOutcome::Committed { .. })
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            RestoreOutcome::Committed { new_pid } => {
                format!("restored slot {} as pid {}", self.slot_id, new_pid)
            }
            RestoreOutcome::CommitFailed { new_pid, error } => format!(
                "pid {} is running but slot {} could not be rebound: {}",
                new_pid, self.slot_id, error
            ),
            RestoreOutcome::RolledBack {
                reason,
                release_error: None,
            } => format!("slot {} released: {}", self.slot_id, reason),
            RestoreOutcome::RolledBack {
                reason,
                release_error: Some(err),
            } => format!(
                "slot {} rolled back ({}), but release failed: {}",
                self.slot_id, reason, err
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("no saved record for slot {0}")]
    NoRecord(SlotId),
    #[error(transparent)]
    Saved(#[from] SavedStoreError),
}

// ============================================================================
// Identity validation
// ============================================================================

/// Identity fields read from a live candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveIdentity {
    pub executable: Option<PathBuf>,
    pub short_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    ExactPath,
    Basename,
    ShortName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Matched(IdentityMatch),
    Mismatch { expected: String, found: String },
    /// Neither side had a field the other could be compared with
    NothingToCompare,
}

fn basename(path: &Path) -> Option<&std::ffi::OsStr> {
    path.file_name()
}

fn describe(exe: Option<&Path>, name: Option<&str>) -> String {
    format!(
        "exe={} name={}",
        exe.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
        name.unwrap_or("(none)")
    )
}

/// Compare a candidate against saved identity: exact executable path, then
/// executable basename. The kernel short name is only consulted when either
/// side lacks an executable path; two known paths that differ are a mismatch
/// even if the short names agree.
pub fn check_identity(
    saved_exe: Option<&Path>,
    saved_name: Option<&str>,
    live: &LiveIdentity,
) -> Verdict {
    let saved_name = saved_name.filter(|n| !n.is_empty());
    let live_exe = live.executable.as_deref();
    let live_name = live.short_name.as_deref().filter(|n| !n.is_empty());
    let mismatch = || Verdict::Mismatch {
        expected: describe(saved_exe, saved_name),
        found: describe(live_exe, live_name),
    };

    if let (Some(expected), Some(found)) = (saved_exe, live_exe) {
        if expected == found {
            return Verdict::Matched(IdentityMatch::ExactPath);
        }
        if basename(expected).is_some() && basename(expected) == basename(found) {
            return Verdict::Matched(IdentityMatch::Basename);
        }
        return mismatch();
    }

    match (saved_name, live_name) {
        (Some(expected), Some(found))
            if procinfo::kernel_short_name(expected) == procinfo::kernel_short_name(found) =>
        {
            Verdict::Matched(IdentityMatch::ShortName)
        }
        (Some(_), Some(_)) => mismatch(),
        _ => Verdict::NothingToCompare,
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Reads identity fields of a running candidate
pub trait ProcessInspector {
    fn identity(&self, pid: Pid) -> LiveIdentity;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsInspector;

impl ProcessInspector for ProcfsInspector {
    fn identity(&self, pid: Pid) -> LiveIdentity {
        LiveIdentity {
            executable: procinfo::read_executable(pid),
            short_name: procinfo::read_short_name(pid),
        }
    }
}

/// Starts candidates and fallback launches
pub trait Launcher {
    /// Start on `terminal` as its foreground job; Err when attaching fails
    fn spawn_attached(&self, plan: &LaunchPlan, terminal: &Path) -> io::Result<Child>;

    /// Start in a new session with stdio on the null device
    fn spawn_detached(&self, plan: &LaunchPlan) -> io::Result<Child>;

    /// Start inside a terminal emulator; returns the emulator used
    fn launch_in_emulator(&self, plan: &LaunchPlan) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn spawn_attached(&self, plan: &LaunchPlan, terminal: &Path) -> io::Result<Child> {
        terminal::spawn_attached(plan, terminal)
    }

    fn spawn_detached(&self, plan: &LaunchPlan) -> io::Result<Child> {
        process_control::spawn_detached(plan.command())
    }

    fn launch_in_emulator(&self, plan: &LaunchPlan) -> Option<String> {
        terminal::launch_in_emulator(plan, None)
    }
}

// ============================================================================
// State machine
// ============================================================================

enum Step {
    Spawning,
    AttachingTerminal(LaunchPlan, PathBuf),
    LaunchingFallback(LaunchPlan),
    Validating(LaunchPlan, Child),
    Committing(Pid),
    RollingBack(RollbackReason),
    Done(RestoreOutcome),
}

impl Step {
    fn phase(&self) -> RestorePhase {
        match self {
            Step::Spawning => RestorePhase::Spawning,
            Step::AttachingTerminal(..) => RestorePhase::AttachingTerminal,
            Step::LaunchingFallback(_) => RestorePhase::LaunchingFallback,
            Step::Validating(..) => RestorePhase::Validating,
            Step::Committing(_) => RestorePhase::Committing,
            Step::RollingBack(_) => RestorePhase::RollingBack,
            Step::Done(_) => RestorePhase::Done,
        }
    }
}

/// Mutable bookkeeping for one restore
struct Run {
    phases: Vec<RestorePhase>,
    notes: Vec<String>,
    attached: bool,
    emulator_tried: bool,
}

impl Run {
    fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        tracing::debug!("{}", note);
        self.notes.push(note);
    }
}

pub struct RestoreOrchestrator<'a, C, L = SystemLauncher, I = ProcfsInspector> {
    channel: &'a C,
    saved: &'a SavedStore,
    settings: RestoreSettings,
    launcher: L,
    inspector: I,
}

impl<'a, C: RegistryChannel> RestoreOrchestrator<'a, C> {
    pub fn new(channel: &'a C, saved: &'a SavedStore, settings: RestoreSettings) -> Self {
        Self {
            channel,
            saved,
            settings,
            launcher: SystemLauncher,
            inspector: ProcfsInspector,
        }
    }
}

impl<'a, C, L, I> RestoreOrchestrator<'a, C, L, I>
where
    C: RegistryChannel,
    L: Launcher,
    I: ProcessInspector,
{
    pub fn with_launcher<L2: Launcher>(self, launcher: L2) -> RestoreOrchestrator<'a, C, L2, I> {
        RestoreOrchestrator {
            channel: self.channel,
            saved: self.saved,
            settings: self.settings,
            launcher,
            inspector: self.inspector,
        }
    }

    pub fn with_inspector<I2: ProcessInspector>(
        self,
        inspector: I2,
    ) -> RestoreOrchestrator<'a, C, L, I2> {
        RestoreOrchestrator {
            channel: self.channel,
            saved: self.saved,
            settings: self.settings,
            launcher: self.launcher,
            inspector,
        }
    }

    /// Restore the saved slot `slot_id`. Runs to completion; there is no
    /// cancellation once the first phase starts.
    pub fn restore(&self, slot_id: SlotId) -> Result<RestoreReport, RestoreError> {
        let record = self
            .saved
            .get(slot_id)?
            .ok_or(RestoreError::NoRecord(slot_id))?;

        let mut run = Run {
            phases: Vec::new(),
            notes: Vec::new(),
            attached: false,
            emulator_tried: false,
        };

        let mut step = Step::Spawning;
        let outcome = loop {
            run.phases.push(step.phase());
            step = match step {
                Step::Spawning => self.spawning(&record, &mut run),
                Step::AttachingTerminal(plan, tty) => self.attaching(plan, &tty, &mut run),
                Step::LaunchingFallback(plan) => self.launching_fallback(plan, &mut run),
                Step::Validating(plan, child) => self.validating(&record, &plan, child, &mut run),
                Step::Committing(new_pid) => self.committing(slot_id, new_pid),
                Step::RollingBack(reason) => self.rolling_back(slot_id, reason),
                Step::Done(outcome) => break outcome,
            };
        };

        // Local state follows the registry whatever happened above.
        if let Err(err) = self.saved.remove(slot_id) {
            tracing::warn!(slot = slot_id, error = %err, "failed to remove saved record");
            run.note(format!("saved record not removed: {}", err));
        }

        let report = RestoreReport {
            slot_id,
            display_name: record.display_name,
            outcome,
            phases: run.phases,
            attached: run.attached,
            notes: run.notes,
        };
        tracing::info!(slot = slot_id, "{}", report.summary());
        Ok(report)
    }

    fn spawning(&self, record: &SavedProcessRecord, run: &mut Run) -> Step {
        let Some(plan) = LaunchPlan::resolve(
            record.argument_vector.as_deref(),
            record.executable_path.as_deref(),
            &record.display_name,
        ) else {
            return Step::RollingBack(RollbackReason::NoProgram);
        };
        let plan = plan.with_working_directory(record.working_directory.clone());

        match &record.controlling_terminal_path {
            Some(tty) => Step::AttachingTerminal(plan, tty.clone()),
            None => {
                run.note("no terminal saved");
                Step::LaunchingFallback(plan)
            }
        }
    }

    fn attaching(&self, plan: LaunchPlan, tty: &Path, run: &mut Run) -> Step {
        match self.launcher.spawn_attached(&plan, tty) {
            Ok(child) => {
                run.attached = true;
                run.note(format!("started pid {} on {}", child.id(), tty.display()));
                Step::Validating(plan, child)
            }
            Err(err) => {
                run.note(format!("could not attach to {}: {}", tty.display(), err));
                Step::LaunchingFallback(plan)
            }
        }
    }

    fn try_emulator(&self, plan: &LaunchPlan, run: &mut Run) -> Option<String> {
        if !self.settings.terminal_fallback || run.emulator_tried {
            return None;
        }
        run.emulator_tried = true;
        let emulator = self.launcher.launch_in_emulator(plan);
        match &emulator {
            Some(name) => run.note(format!("launched {} in {}", plan.program, name)),
            None => run.note("no terminal emulator available"),
        }
        emulator
    }

    fn launching_fallback(&self, plan: LaunchPlan, run: &mut Run) -> Step {
        if let Some(emulator) = self.try_emulator(&plan, run) {
            return Step::RollingBack(RollbackReason::HandedOffToTerminal(emulator));
        }
        match self.launcher.spawn_detached(&plan) {
            Ok(child) => {
                run.note(format!("started pid {} detached", child.id()));
                Step::Validating(plan, child)
            }
            Err(err) => Step::RollingBack(RollbackReason::LaunchFailed(err.to_string())),
        }
    }

    fn validating(
        &self,
        record: &SavedProcessRecord,
        plan: &LaunchPlan,
        mut child: Child,
        run: &mut Run,
    ) -> Step {
        let watch = process_control::watch_child(
            &mut child,
            self.settings.validation_window,
            self.settings.poll_interval,
        );
        if let ChildWatch::Exited(status) = watch {
            run.note(format!("candidate exited early with {}", status));
            self.try_emulator(plan, run);
            return Step::RollingBack(RollbackReason::SpawnFailed {
                exit_code: status.code(),
            });
        }

        let pid = child.id() as Pid;
        let live = self.inspector.identity(pid);
        let verdict = check_identity(
            record.executable_path.as_deref(),
            Some(record.display_name.as_str()),
            &live,
        );

        let rejection = match verdict {
            Verdict::Matched(kind) => {
                run.note(format!("candidate {} matched by {:?}", pid, kind));
                None
            }
            Verdict::NothingToCompare => match self.settings.validation_policy {
                ValidationPolicy::Permissive => {
                    run.note(format!("no identity to compare, accepting {}", pid));
                    None
                }
                ValidationPolicy::Strict => Some(RollbackReason::ValidationMismatch {
                    expected: "(no saved identity)".to_string(),
                    found: describe(live.executable.as_deref(), live.short_name.as_deref()),
                }),
            },
            Verdict::Mismatch { expected, found } => {
                Some(RollbackReason::ValidationMismatch { expected, found })
            }
        };

        match rejection {
            None => {
                // The candidate now belongs to its slot; only reap it.
                process_control::reap_in_background(child);
                Step::Committing(pid)
            }
            Some(reason) => {
                process_control::kill_child(&mut child);
                self.try_emulator(plan, run);
                Step::RollingBack(reason)
            }
        }
    }

    fn committing(&self, slot_id: SlotId, new_pid: Pid) -> Step {
        match self.channel.release_or_rebind(slot_id, new_pid) {
            Ok(_) => Step::Done(RestoreOutcome::Committed { new_pid }),
            Err(err) => {
                tracing::error!(slot = slot_id, new_pid, error = %err, "rebind failed");
                Step::Done(RestoreOutcome::CommitFailed {
                    new_pid,
                    error: err.to_string(),
                })
            }
        }
    }

    fn rolling_back(&self, slot_id: SlotId, reason: RollbackReason) -> Step {
        let release_error = match self.channel.release_or_rebind(slot_id, RELEASE_SENTINEL) {
            Ok(_) => None,
            Err(err) => {
                tracing::error!(slot = slot_id, error = %err, "release failed");
                Some(err.to_string())
            }
        };
        Step::Done(RestoreOutcome::RolledBack {
            reason,
            release_error,
        })
    }
}
