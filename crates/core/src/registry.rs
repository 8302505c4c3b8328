//! Arena-resident registry mapping prompt hashes to published trees.
//!
//! The registry is a fixed-capacity open-addressing table living at a
//! fixed offset inside the shared region, so every attached process sees
//! the same entries. All operations require the arena's registry lock,
//! passed as an [`ArenaGuard`] so a whole batch can share one acquisition.
//!
//! Publication semantics: `publish` either inserts a new entry or swaps
//! the tree offset of an existing one, returning the superseded offset.
//! The caller frees the superseded tree *after* releasing the lock, so a
//! concurrent lookup observes either the old tree or the new one, never a
//! torn state.

use std::ptr;

use crate::arena::{ArenaGuard, RegistryEntry, SharedArena};
use crate::error::CacheError;

/// Marks a slot whose entry was removed; probing continues past it.
const TOMBSTONE: u64 = u64::MAX;

pub struct TreeRegistry<'a> {
    arena: &'a SharedArena,
}

impl<'a> TreeRegistry<'a> {
    pub(crate) fn new(arena: &'a SharedArena) -> Self {
        Self { arena }
    }

    fn capacity(&self) -> usize {
        self.arena.header().registry_cap as usize
    }

    fn slot_ptr(&self, index: usize) -> *mut RegistryEntry {
        debug_assert!(index < self.capacity());
        let off = self.arena.header().registry_off
            + (index * std::mem::size_of::<RegistryEntry>()) as u64;
        // SAFETY: the slot array was sized from registry_cap at creation.
        unsafe { self.arena.ptr_at(off) as *mut RegistryEntry }
    }

    fn read_slot(&self, index: usize) -> RegistryEntry {
        // SAFETY: in-bounds slot, plain-old-data, caller holds the lock.
        unsafe { ptr::read(self.slot_ptr(index)) }
    }

    fn write_slot(&self, index: usize, hash: u64, tree_off: u64) {
        unsafe { ptr::write(self.slot_ptr(index), RegistryEntry { hash, tree_off }) }
    }

    /// Insert or replace the tree for `hash`, returning the superseded
    /// tree offset if one was present. The caller must destroy it after
    /// releasing the lock.
    pub fn publish(
        &self,
        _lock: &ArenaGuard<'_>,
        hash: u64,
        tree_off: u64,
    ) -> Result<Option<u64>, CacheError> {
        let cap = self.capacity();
        let mut first_tombstone: Option<usize> = None;
        for probe in 0..cap {
            let index = (hash as usize + probe) % cap;
            let slot = self.read_slot(index);
            if slot.tree_off == 0 {
                let target = first_tombstone.unwrap_or(index);
                self.write_slot(target, hash, tree_off);
                return Ok(None);
            }
            if slot.tree_off == TOMBSTONE {
                first_tombstone.get_or_insert(index);
                continue;
            }
            if slot.hash == hash {
                self.write_slot(index, hash, tree_off);
                return Ok(Some(slot.tree_off));
            }
        }
        if let Some(index) = first_tombstone {
            self.write_slot(index, hash, tree_off);
            return Ok(None);
        }
        Err(CacheError::RegistryFull { capacity: cap })
    }

    /// Offset of the tree published for `hash`, if any.
    pub fn lookup(&self, _lock: &ArenaGuard<'_>, hash: u64) -> Option<u64> {
        let cap = self.capacity();
        for probe in 0..cap {
            let index = (hash as usize + probe) % cap;
            let slot = self.read_slot(index);
            if slot.tree_off == 0 {
                return None;
            }
            if slot.tree_off != TOMBSTONE && slot.hash == hash {
                return Some(slot.tree_off);
            }
        }
        None
    }

    /// Unpublish `hash`, returning the tree offset that was registered.
    pub fn remove(&self, _lock: &ArenaGuard<'_>, hash: u64) -> Option<u64> {
        let cap = self.capacity();
        for probe in 0..cap {
            let index = (hash as usize + probe) % cap;
            let slot = self.read_slot(index);
            if slot.tree_off == 0 {
                return None;
            }
            if slot.tree_off != TOMBSTONE && slot.hash == hash {
                self.write_slot(index, hash, TOMBSTONE);
                return Some(slot.tree_off);
            }
        }
        None
    }

    /// Clear the registry, returning every published tree offset so the
    /// caller can destroy them. Used on server shutdown.
    pub fn drain(&self, _lock: &ArenaGuard<'_>) -> Vec<u64> {
        let cap = self.capacity();
        let mut trees = Vec::new();
        for index in 0..cap {
            let slot = self.read_slot(index);
            if slot.tree_off != 0 && slot.tree_off != TOMBSTONE {
                trees.push(slot.tree_off);
            }
            self.write_slot(index, 0, 0);
        }
        trees
    }

    /// Number of live entries. Linear scan; intended for tests and stats.
    pub fn len(&self, _lock: &ArenaGuard<'_>) -> usize {
        (0..self.capacity())
            .map(|i| self.read_slot(i))
            .filter(|s| s.tree_off != 0 && s.tree_off != TOMBSTONE)
            .count()
    }

    pub fn is_empty(&self, lock: &ArenaGuard<'_>) -> bool {
        self.len(lock) == 0
    }
}
