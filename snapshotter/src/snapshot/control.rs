// Registry control interface
//
// Validates capture and release/rebind requests and applies them to the
// registry store. Every logical operation runs under one lock, held from the
// first check to the last mutation, so concurrent callers see each request
// either fully applied or not at all.

use crate::snapshot::procinfo::{self, Eligibility};
use crate::snapshot::protocol::{EntryView, Pid, SlotId, StatusCode, RELEASE_SENTINEL};
use crate::snapshot::registry::{
    HeldReference, Rebinding, RegistryStore, SnapshotEntry, StoreError, MAX_SNAPS,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Failure of a registry request. Nothing was changed when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("snapshot table full")]
    TableFull,
    #[error("no slot for id {0}")]
    NoSuchSlot(SlotId),
    #[error("no live process with id {0}")]
    NoSuchProcess(Pid),
    #[error("process {0} is not a user-space program")]
    NotEligible(Pid),
    #[error("process {0} already owns a slot")]
    AlreadyTracked(Pid),
    #[error("could not hold process {pid}: {reason}")]
    HoldFailed { pid: Pid, reason: String },
}

impl RegistryError {
    pub fn status(&self) -> StatusCode {
        match self {
            RegistryError::TableFull => StatusCode::TableFull,
            RegistryError::NoSuchSlot(_) => StatusCode::NoSuchSlot,
            RegistryError::NoSuchProcess(_) => StatusCode::NoSuchProcess,
            RegistryError::NotEligible(_) => StatusCode::NotEligible,
            RegistryError::AlreadyTracked(_) => StatusCode::AlreadyTracked,
            RegistryError::HoldFailed { .. } => StatusCode::HoldFailed,
        }
    }

    /// Rebuild an error from a wire status. `slot` is the slot named by the
    /// request and `pid` the process it asked about.
    pub fn from_status(
        status: StatusCode,
        slot: SlotId,
        pid: Pid,
        message: Option<String>,
    ) -> Option<Self> {
        let err = match status {
            StatusCode::Ok => return None,
            StatusCode::TableFull => RegistryError::TableFull,
            StatusCode::NoSuchSlot => RegistryError::NoSuchSlot(slot),
            StatusCode::NoSuchProcess => RegistryError::NoSuchProcess(pid),
            StatusCode::NotEligible => RegistryError::NotEligible(pid),
            StatusCode::AlreadyTracked => RegistryError::AlreadyTracked(pid),
            StatusCode::HoldFailed => RegistryError::HoldFailed {
                pid,
                reason: message.unwrap_or_else(|| status.to_string()),
            },
        };
        Some(err)
    }
}

/// A process that passed the eligibility rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub uid: Option<u32>,
    pub display_name: String,
}

/// Resolves, classifies and pins processes for the registry
pub trait ProcessTable: Send + Sync {
    /// Resolve `pid` to a live, eligible process
    fn resolve(&self, pid: Pid) -> Result<ProcessIdentity, RegistryError>;

    /// Take a reference that keeps the process resource from being reclaimed
    fn hold(&self, identity: &ProcessIdentity) -> Result<HeldReference, RegistryError>;
}

/// Process table backed by procfs, holding processes through pidfds
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsTable;

impl ProcessTable for ProcfsTable {
    fn resolve(&self, pid: Pid) -> Result<ProcessIdentity, RegistryError> {
        match procinfo::classify(pid) {
            None => Err(RegistryError::NoSuchProcess(pid)),
            Some(Eligibility::KernelThread) | Some(Eligibility::NoMemoryContext) => {
                Err(RegistryError::NotEligible(pid))
            }
            Some(Eligibility::UserProgram) => Ok(ProcessIdentity {
                pid,
                uid: procinfo::read_uid(pid),
                display_name: procinfo::read_short_name(pid).unwrap_or_default(),
            }),
        }
    }

    fn hold(&self, identity: &ProcessIdentity) -> Result<HeldReference, RegistryError> {
        let fd = pidfd_open(identity.pid).map_err(|err| {
            if err.raw_os_error() == Some(libc::ESRCH) {
                RegistryError::NoSuchProcess(identity.pid)
            } else {
                RegistryError::HoldFailed {
                    pid: identity.pid,
                    reason: err.to_string(),
                }
            }
        })?;
        Ok(HeldReference::new(identity.pid, fd))
    }
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: Pid) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor or -1.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the kernel just handed us ownership of this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

#[cfg(not(target_os = "linux"))]
fn pidfd_open(_pid: Pid) -> std::io::Result<std::os::fd::OwnedFd> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "pidfd_open is only available on Linux",
    ))
}

fn store_error(err: StoreError, slot: SlotId) -> RegistryError {
    match err {
        StoreError::Full(_) => RegistryError::TableFull,
        StoreError::Duplicate(id) => RegistryError::AlreadyTracked(id),
        StoreError::Vacant(_) => RegistryError::NoSuchSlot(slot),
    }
}

/// The registry: store plus the process table used to validate requests
#[derive(Debug)]
pub struct RegistryControl<T: ProcessTable = ProcfsTable> {
    store: Mutex<RegistryStore>,
    table: T,
}

impl RegistryControl<ProcfsTable> {
    pub fn new() -> Self {
        Self::with_table(ProcfsTable, MAX_SNAPS)
    }
}

impl Default for RegistryControl<ProcfsTable> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ProcessTable> RegistryControl<T> {
    pub fn with_table(table: T, capacity: usize) -> Self {
        Self {
            store: Mutex::new(RegistryStore::with_capacity(capacity)),
            table,
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, RegistryStore> {
        // Each mutation is one store call, so a poisoned store is still consistent.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `pid` in a new slot
    pub fn capture(&self, pid: Pid) -> Result<EntryView, RegistryError> {
        let mut store = self.lock();

        if store.is_full() {
            tracing::warn!(pid, capacity = store.capacity(), "capture refused: table full");
            return Err(RegistryError::TableFull);
        }
        if store.contains(pid) {
            return Err(RegistryError::AlreadyTracked(pid));
        }

        let identity = self.table.resolve(pid)?;
        let held = self.table.hold(&identity)?;
        let entry = SnapshotEntry::new(pid, held, identity.uid, identity.display_name);
        let view = entry.view();
        store.insert(entry).map_err(|err| store_error(err, pid))?;

        tracing::info!(
            slot = pid,
            name = %view.display_name,
            live = store.len(),
            "captured process"
        );
        Ok(view)
    }

    /// Release slot `old_pid` when `new_pid` is the sentinel, otherwise move
    /// it onto `new_pid`. Returns the rebound slot, or None after a release.
    pub fn release_or_rebind(
        &self,
        old_pid: SlotId,
        new_pid: Pid,
    ) -> Result<Option<EntryView>, RegistryError> {
        let mut store = self.lock();
        let idx = store
            .find(old_pid)
            .ok_or(RegistryError::NoSuchSlot(old_pid))?;

        if new_pid == RELEASE_SENTINEL {
            let removed = store.remove_at(idx);
            drop(store);
            drop(removed);
            tracing::info!(slot = old_pid, "released slot");
            return Ok(None);
        }

        if new_pid != old_pid && store.contains(new_pid) {
            return Err(RegistryError::AlreadyTracked(new_pid));
        }

        // Acquire the new reference before letting go of the old one.
        let identity = self.table.resolve(new_pid)?;
        let held = self.table.hold(&identity)?;
        let previous = store
            .replace_at(
                idx,
                Rebinding {
                    slot_id: new_pid,
                    held,
                    owner_uid: identity.uid,
                    display_name: identity.display_name,
                },
            )
            .map_err(|err| store_error(err, old_pid))?;
        let view = store.get(idx).map(SnapshotEntry::view);
        drop(previous);

        tracing::info!(old = old_pid, new = new_pid, "rebound slot");
        Ok(view)
    }

    /// Read-only view of every slot
    pub fn entries(&self) -> Vec<EntryView> {
        self.lock().views()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every slot and its reference. Used at daemon shutdown.
    pub fn release_all(&self) -> usize {
        let released = self.lock().clear();
        if released > 0 {
            tracing::info!(released, "released all slots");
        }
        released
    }
}
