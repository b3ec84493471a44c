// Capture agent
//
// Order matters here. Metadata is read while the process still exists, the
// registry must accept the slot before anything is persisted, and the process
// is only terminated once its record is on disk.

use crate::snapshot::config::CaptureSettings;
use crate::snapshot::daemon_client::{ChannelError, RegistryChannel};
use crate::snapshot::procinfo;
use crate::snapshot::process_control::{self, Termination};
use crate::snapshot::protocol::{EntryView, Pid, RELEASE_SENTINEL};
use crate::snapshot::saved::{SavedProcessRecord, SavedStore, SavedStoreError};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("refusing to capture this process itself")]
    SelfCapture,
    #[error("saved record table full ({0} records)")]
    SavedTableFull(usize),
    #[error("registry refused capture of {pid}: {source}")]
    Refused {
        pid: Pid,
        #[source]
        source: ChannelError,
    },
    #[error("could not persist record for {pid}: {source}")]
    Persist {
        pid: Pid,
        #[source]
        source: SavedStoreError,
    },
    #[error(transparent)]
    Saved(#[from] SavedStoreError),
}

/// What a successful capture did
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub entry: EntryView,
    pub record: SavedProcessRecord,
    pub termination: Termination,
}

pub struct CaptureAgent<'a, C: RegistryChannel> {
    channel: &'a C,
    saved: &'a SavedStore,
    settings: CaptureSettings,
}

impl<'a, C: RegistryChannel> CaptureAgent<'a, C> {
    pub fn new(channel: &'a C, saved: &'a SavedStore, settings: CaptureSettings) -> Self {
        Self {
            channel,
            saved,
            settings,
        }
    }

    /// Snapshot `pid` and terminate it. On any error before termination the
    /// process is left running and nothing stays persisted.
    pub fn capture(&self, pid: Pid) -> Result<CaptureReport, CaptureError> {
        if pid == std::process::id() as Pid {
            return Err(CaptureError::SelfCapture);
        }
        if self.saved.is_full()? {
            return Err(CaptureError::SavedTableFull(self.saved.capacity()));
        }

        let info = procinfo::inspect(pid);
        tracing::debug!(
            pid,
            exe = ?info.executable_path,
            tty = ?info.controlling_terminal,
            "gathered relaunch metadata"
        );

        let entry = self
            .channel
            .capture(pid)
            .map_err(|source| CaptureError::Refused { pid, source })?;

        let mut record = SavedProcessRecord::from_info(info);
        if record.display_name.is_empty() {
            record.display_name = entry.display_name.clone();
        }

        if let Err(source) = self.saved.insert(record.clone()) {
            // Without a record the slot could never be restored; give it back.
            if let Err(err) = self.channel.release_or_rebind(pid, RELEASE_SENTINEL) {
                tracing::error!(pid, error = %err, "failed to release slot after persist failure");
            }
            return Err(CaptureError::Persist { pid, source });
        }

        let termination = process_control::terminate(pid, self.settings.term_grace);
        if termination.confirmed {
            tracing::info!(pid, forced = termination.forced, "captured process terminated");
        } else {
            tracing::warn!(pid, "captured process may still be running");
        }

        Ok(CaptureReport {
            entry,
            record,
            termination,
        })
    }
}
