// Saved process records
// Relaunch metadata for captured processes, persisted to <state_dir>/saved.json.
// Read-modify-write cycles hold an exclusive lock on a sidecar lock file and
// replace the data file by rename.

use crate::snapshot::config::Config;
use crate::snapshot::procinfo::ProcessInfo;
use crate::snapshot::protocol::SlotId;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Maximum number of saved records
pub const MAX_SAVED: usize = 64;

/// Everything needed to relaunch a captured process and check the relaunch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedProcessRecord {
    /// Registry slot this record belongs to
    pub slot_id: SlotId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_vector: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlling_terminal_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    pub saved_at: DateTime<Utc>,
}

impl SavedProcessRecord {
    pub fn from_info(info: ProcessInfo) -> Self {
        Self {
            slot_id: info.pid,
            display_name: info.short_name.unwrap_or_default(),
            executable_path: info.executable_path,
            argument_vector: info.argument_vector,
            controlling_terminal_path: info.controlling_terminal,
            working_directory: info.working_directory,
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SavedStoreError {
    #[error("saved record table full ({0} records)")]
    Full(usize),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SavedStoreError + '_ {
    move |source| SavedStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedFile {
    records: Vec<SavedProcessRecord>,
}

/// File-backed table of saved records
#[derive(Debug, Clone)]
pub struct SavedStore {
    path: PathBuf,
    lock_path: PathBuf,
    capacity: usize,
}

impl SavedStore {
    pub fn new(config: &Config) -> Self {
        Self::at(config.saved_file())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            capacity: MAX_SAVED,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<File, SavedStoreError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(io_error(&self.lock_path))?;
        file.lock_exclusive().map_err(io_error(&self.lock_path))?;
        Ok(file)
    }

    fn read(&self) -> Result<SavedFile, SavedStoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SavedFile::default())
            }
            Err(err) => return Err(io_error(&self.path)(err)),
        };
        if contents.trim().is_empty() {
            return Ok(SavedFile::default());
        }
        serde_json::from_str(&contents).map_err(|source| SavedStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, file: &SavedFile) -> Result<(), SavedStoreError> {
        let contents = serde_json::to_string_pretty(file).map_err(|source| {
            SavedStoreError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        atomic_write(&self.path, &contents)
    }

    /// Run `f` over the records under the lock and write back the result
    fn update<R>(
        &self,
        f: impl FnOnce(&mut Vec<SavedProcessRecord>) -> Result<R, SavedStoreError>,
    ) -> Result<R, SavedStoreError> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        let result = f(&mut file.records)?;
        self.write(&file)?;
        Ok(result)
    }

    /// All records, oldest first
    pub fn load(&self) -> Result<Vec<SavedProcessRecord>, SavedStoreError> {
        let _lock = self.lock()?;
        Ok(self.read()?.records)
    }

    pub fn get(&self, slot_id: SlotId) -> Result<Option<SavedProcessRecord>, SavedStoreError> {
        Ok(self.load()?.into_iter().find(|r| r.slot_id == slot_id))
    }

    pub fn len(&self) -> Result<usize, SavedStoreError> {
        Ok(self.load()?.len())
    }

    pub fn is_full(&self) -> Result<bool, SavedStoreError> {
        Ok(self.len()? >= self.capacity)
    }

    /// Store a record. A leftover record for the same slot is replaced: the
    /// registry just accepted that slot, so the old one is stale.
    pub fn insert(&self, record: SavedProcessRecord) -> Result<(), SavedStoreError> {
        let capacity = self.capacity;
        self.update(move |records| {
            if let Some(pos) = records.iter().position(|r| r.slot_id == record.slot_id) {
                tracing::warn!(slot = record.slot_id, "replacing stale saved record");
                records.remove(pos);
            } else if records.len() >= capacity {
                return Err(SavedStoreError::Full(capacity));
            }
            records.push(record);
            Ok(())
        })
    }

    pub fn remove(&self, slot_id: SlotId) -> Result<Option<SavedProcessRecord>, SavedStoreError> {
        self.update(|records| {
            Ok(records
                .iter()
                .position(|r| r.slot_id == slot_id)
                .map(|pos| records.remove(pos)))
        })
    }
}

/// Write-to-temp then rename, so readers never see a partial file
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), SavedStoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_error(parent))?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("saved"),
        std::process::id()
    ));
    fs::write(&temp_path, contents).map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_store() -> (SavedStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::in_dir(temp_dir.path());
        (SavedStore::new(&config), temp_dir)
    }

    fn record(slot_id: SlotId, name: &str) -> SavedProcessRecord {
        SavedProcessRecord {
            slot_id,
            display_name: name.to_string(),
            executable_path: Some(PathBuf::from(format!("/usr/bin/{}", name))),
            argument_vector: Some(vec![name.to_string()]),
            controlling_terminal_path: Some(PathBuf::from("/dev/pts/3")),
            working_directory: None,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_persist_across_instances() {
        let (store, temp) = test_store();
        store.insert(record(100, "vim")).unwrap();
        store.insert(record(200, "top")).unwrap();

        let reopened = SavedStore::new(&Config::in_dir(temp.path()));
        let records = reopened.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record_with_time(100, "vim", records[0].saved_at));
        assert_eq!(reopened.get(200).unwrap().unwrap().display_name, "top");
        assert!(reopened.get(300).unwrap().is_none());
    }

    fn record_with_time(slot_id: SlotId, name: &str, saved_at: DateTime<Utc>) -> SavedProcessRecord {
        SavedProcessRecord {
            saved_at,
            ..record(slot_id, name)
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let (store, _temp) = test_store();
        assert!(store.load().unwrap().is_empty());
        assert!(!store.is_full().unwrap());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (store, _temp) = test_store();
        let store = store.with_capacity(2);
        store.insert(record(1, "a")).unwrap();
        store.insert(record(2, "b")).unwrap();

        assert!(store.is_full().unwrap());
        assert!(matches!(
            store.insert(record(3, "c")),
            Err(SavedStoreError::Full(2))
        ));
        // same slot replaces instead of growing
        store.insert(record(2, "b2")).unwrap();
        assert_eq!(store.get(2).unwrap().unwrap().display_name, "b2");
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_remove() {
        let (store, _temp) = test_store();
        store.insert(record(100, "vim")).unwrap();

        let removed = store.remove(100).unwrap().unwrap();
        assert_eq!(removed.slot_id, 100);
        assert!(store.remove(100).unwrap().is_none());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let (store, _temp) = test_store();
        let mut bare = record(7, "x");
        bare.executable_path = None;
        bare.argument_vector = None;
        bare.controlling_terminal_path = None;
        store.insert(bare).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(!text.contains("executable_path"));
        assert!(!text.contains("controlling_terminal_path"));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (store, _temp) = test_store();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(SavedStoreError::Parse { .. })));
    }
}
