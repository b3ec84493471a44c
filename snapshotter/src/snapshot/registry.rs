// Registry store: fixed-capacity table of snapshot entries
//
// Entries live in a dense arena addressed by index; a side map from slot id to
// index is kept in step on every insert, replace and remove. Removal swaps the
// last entry into the freed index, so entry order is not stable.
//
// The store does no locking of its own. RegistryControl owns it behind a
// single mutex.

use crate::snapshot::protocol::{EntryView, Pid, SlotId};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Maximum number of live snapshot entries
pub const MAX_SNAPS: usize = 64;

/// The registry's claim on a tracked process. Dropping it releases the claim.
pub struct HeldReference {
    pid: Pid,
    _guard: Box<dyn Any + Send + Sync>,
}

impl HeldReference {
    pub fn new<G: Any + Send + Sync>(pid: Pid, guard: G) -> Self {
        Self {
            pid,
            _guard: Box::new(guard),
        }
    }

    /// Process the reference was taken on
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl fmt::Debug for HeldReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldReference").field("pid", &self.pid).finish()
    }
}

/// One tracked process
#[derive(Debug)]
pub struct SnapshotEntry {
    pub slot_id: SlotId,
    pub held: HeldReference,
    /// Recorded for audit; not enforced against callers
    pub owner_uid: Option<u32>,
    pub display_name: String,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotEntry {
    pub fn new(
        slot_id: SlotId,
        held: HeldReference,
        owner_uid: Option<u32>,
        display_name: String,
    ) -> Self {
        Self {
            slot_id,
            held,
            owner_uid,
            display_name,
            captured_at: Utc::now(),
        }
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            slot_id: self.slot_id,
            owner_uid: self.owner_uid,
            display_name: self.display_name.clone(),
            captured_at: self.captured_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot table full ({0} entries)")]
    Full(usize),
    #[error("slot {0} already exists")]
    Duplicate(SlotId),
    #[error("no entry at index {0}")]
    Vacant(usize),
}

/// Replacement identity for an existing slot
#[derive(Debug)]
pub struct Rebinding {
    pub slot_id: SlotId,
    pub held: HeldReference,
    pub owner_uid: Option<u32>,
    pub display_name: String,
}

/// Arena of snapshot entries plus a slot id -> index map
#[derive(Debug)]
pub struct RegistryStore {
    entries: Vec<SnapshotEntry>,
    index: HashMap<SlotId, usize>,
    capacity: usize,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::with_capacity(MAX_SNAPS)
    }
}

impl RegistryStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, slot_id: SlotId) -> bool {
        self.index.contains_key(&slot_id)
    }

    /// Add an entry. On error the entry (and its reference) is dropped.
    pub fn insert(&mut self, entry: SnapshotEntry) -> Result<usize, StoreError> {
        if self.is_full() {
            return Err(StoreError::Full(self.capacity));
        }
        if self.contains(entry.slot_id) {
            return Err(StoreError::Duplicate(entry.slot_id));
        }
        let idx = self.entries.len();
        self.index.insert(entry.slot_id, idx);
        self.entries.push(entry);
        Ok(idx)
    }

    pub fn find(&self, slot_id: SlotId) -> Option<usize> {
        self.index.get(&slot_id).copied()
    }

    pub fn get(&self, idx: usize) -> Option<&SnapshotEntry> {
        self.entries.get(idx)
    }

    /// Move the slot at `idx` onto a new process, returning the previous
    /// reference. The caller drops it only after the new state is published.
    pub fn replace_at(
        &mut self,
        idx: usize,
        rebinding: Rebinding,
    ) -> Result<HeldReference, StoreError> {
        let Some(entry) = self.entries.get_mut(idx) else {
            return Err(StoreError::Vacant(idx));
        };
        let old_slot = entry.slot_id;
        if rebinding.slot_id != old_slot && self.index.contains_key(&rebinding.slot_id) {
            return Err(StoreError::Duplicate(rebinding.slot_id));
        }

        let old_held = std::mem::replace(&mut entry.held, rebinding.held);
        entry.slot_id = rebinding.slot_id;
        entry.owner_uid = rebinding.owner_uid;
        entry.display_name = rebinding.display_name;
        entry.captured_at = Utc::now();

        self.index.remove(&old_slot);
        self.index.insert(rebinding.slot_id, idx);
        Ok(old_held)
    }

    /// Remove the entry at `idx`, moving the last entry into its place
    pub fn remove_at(&mut self, idx: usize) -> Option<SnapshotEntry> {
        if idx >= self.entries.len() {
            return None;
        }
        let removed = self.entries.swap_remove(idx);
        self.index.remove(&removed.slot_id);
        if let Some(moved) = self.entries.get(idx) {
            self.index.insert(moved.slot_id, idx);
        }
        Some(removed)
    }

    /// Drop every entry and its reference
    pub fn clear(&mut self) -> usize {
        let released = self.entries.len();
        self.index.clear();
        self.entries.clear();
        released
    }

    pub fn views(&self) -> Vec<EntryView> {
        self.entries.iter().map(SnapshotEntry::view).collect()
    }

    /// Check that the side index agrees with the arena
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.entries.len(), self.index.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            assert_eq!(self.index.get(&entry.slot_id), Some(&idx));
            assert_eq!(entry.held.pid(), entry.slot_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn held(pid: Pid, live: &Arc<AtomicUsize>) -> HeldReference {
        live.fetch_add(1, Ordering::SeqCst);
        HeldReference::new(pid, Counted(Arc::clone(live)))
    }

    fn entry(pid: Pid, live: &Arc<AtomicUsize>) -> SnapshotEntry {
        SnapshotEntry::new(pid, held(pid, live), Some(1000), format!("proc{}", pid))
    }

    #[test]
    fn test_insert_and_find() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::default();

        let idx = store.insert(entry(100, &live)).unwrap();
        assert_eq!(store.find(100), Some(idx));
        assert_eq!(store.find(101), None);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        store.assert_consistent();
    }

    #[test]
    fn test_insert_rejects_duplicates_and_overflow() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::with_capacity(2);

        store.insert(entry(1, &live)).unwrap();
        assert_eq!(
            store.insert(entry(1, &live)).unwrap_err(),
            StoreError::Duplicate(1)
        );
        store.insert(entry(2, &live)).unwrap();
        assert_eq!(store.insert(entry(3, &live)).unwrap_err(), StoreError::Full(2));

        // rejected entries released their references
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 2);
        store.assert_consistent();
    }

    #[test]
    fn test_remove_swaps_last_entry_and_fixes_index() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::default();
        for pid in [10, 20, 30, 40] {
            store.insert(entry(pid, &live)).unwrap();
        }

        let idx = store.find(20).unwrap();
        let removed = store.remove_at(idx).unwrap();
        assert_eq!(removed.slot_id, 20);
        drop(removed);

        assert_eq!(store.find(20), None);
        assert_eq!(store.find(40), Some(idx));
        assert_eq!(live.load(Ordering::SeqCst), 3);
        store.assert_consistent();

        // removing the last slot moves nothing
        let last = store.find(30).unwrap();
        assert_eq!(last, store.len() - 1);
        store.remove_at(last).unwrap();
        store.assert_consistent();
        assert!(store.remove_at(10).is_none());
    }

    #[test]
    fn test_replace_hands_back_old_reference() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::default();
        store.insert(entry(100, &live)).unwrap();
        store.insert(entry(200, &live)).unwrap();

        let idx = store.find(100).unwrap();
        let old = store
            .replace_at(
                idx,
                Rebinding {
                    slot_id: 250,
                    held: held(250, &live),
                    owner_uid: Some(1000),
                    display_name: "proc250".to_string(),
                },
            )
            .unwrap();

        // both references alive until the caller drops the old one
        assert_eq!(live.load(Ordering::SeqCst), 3);
        assert_eq!(old.pid(), 100);
        drop(old);
        assert_eq!(live.load(Ordering::SeqCst), 2);

        assert_eq!(store.find(100), None);
        assert_eq!(store.find(250), Some(idx));
        store.assert_consistent();
    }

    #[test]
    fn test_replace_refuses_to_collide_with_another_slot() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::default();
        store.insert(entry(100, &live)).unwrap();
        store.insert(entry(200, &live)).unwrap();

        let idx = store.find(100).unwrap();
        let err = store
            .replace_at(
                idx,
                Rebinding {
                    slot_id: 200,
                    held: held(200, &live),
                    owner_uid: None,
                    display_name: String::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err, StoreError::Duplicate(200));
        assert_eq!(store.find(100), Some(idx));
        assert_eq!(live.load(Ordering::SeqCst), 2);
        store.assert_consistent();
    }

    #[test]
    fn test_clear_releases_everything() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut store = RegistryStore::default();
        for pid in 1..=5 {
            store.insert(entry(pid, &live)).unwrap();
        }
        assert_eq!(store.clear(), 5);
        assert!(store.is_empty());
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
