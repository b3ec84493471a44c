use snapshotter_lib::snapshot::control::{ProcessIdentity, ProcessTable, RegistryError};
use snapshotter_lib::snapshot::protocol::Pid;
use snapshotter_lib::snapshot::registry::HeldReference;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Pin(Arc<AtomicUsize>);

impl Drop for Pin {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Treats every positive pid as a live user program, except the ones marked
/// as kernel threads. Counts outstanding held references.
#[derive(Default)]
pub struct PermissiveTable {
    kernel: Mutex<HashSet<Pid>>,
    live_refs: Arc<AtomicUsize>,
}

impl PermissiveTable {
    pub fn with_kernel_threads(pids: &[Pid]) -> Self {
        let table = Self::default();
        table.kernel.lock().unwrap().extend(pids.iter().copied());
        table
    }

    pub fn live_refs(&self) -> usize {
        self.live_refs.load(Ordering::SeqCst)
    }
}

impl ProcessTable for PermissiveTable {
    fn resolve(&self, pid: Pid) -> Result<ProcessIdentity, RegistryError> {
        if pid <= 0 {
            return Err(RegistryError::NoSuchProcess(pid));
        }
        if self.kernel.lock().unwrap().contains(&pid) {
            return Err(RegistryError::NotEligible(pid));
        }
        Ok(ProcessIdentity {
            pid,
            uid: Some(1000),
            display_name: format!("proc{}", pid),
        })
    }

    fn hold(&self, identity: &ProcessIdentity) -> Result<HeldReference, RegistryError> {
        self.live_refs.fetch_add(1, Ordering::SeqCst);
        Ok(HeldReference::new(identity.pid, Pin(Arc::clone(&self.live_refs))))
    }
}
