//! Linear-probing table with a tracked displacement bound
//!
//! Used twice by the weak reference table: once for the referent entries
//! and once per entry for its referrer slots. Lookups probe at most
//! `max_displacement + 1` slots, so the bound must never fall below the
//! displacement of any live entry. Insertion is the only operation that
//! raises it; resizing recomputes it from scratch.

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Entries stored in a [`ProbeTable`] are keyed by an address.
pub trait ProbeEntry {
    /// Lookup key
    fn key(&self) -> usize;
}

/// Insertion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// Every slot is occupied
    #[error("no room for new entry")]
    Full,
}

/// Open-addressed table of `T` with linear probing.
#[derive(Debug, Clone)]
pub struct ProbeTable<T> {
    slots: Vec<Option<T>>,
    len: usize,
    max_displacement: usize,
}

impl<T: ProbeEntry> ProbeTable<T> {
    /// An unallocated table
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            max_displacement: 0,
        }
    }

    /// A table with `size` slots
    pub fn with_size(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self {
            slots,
            len: 0,
            max_displacement: 0,
        }
    }

    /// Live entries
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no entry is live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated slots
    #[inline]
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Current probe bound
    #[inline]
    pub fn max_displacement(&self) -> usize {
        self.max_displacement
    }

    #[inline]
    fn home(&self, key: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(key);
        hasher.finish() as usize % self.slots.len()
    }

    /// Slot index of the entry keyed by `key`
    pub fn find(&self, key: usize) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let home = self.home(key);
        (0..=self.max_displacement.min(self.slots.len() - 1))
            .map(|displacement| (home + displacement) % self.slots.len())
            .find(|&index| matches!(&self.slots[index], Some(entry) if entry.key() == key))
    }

    /// Entry at slot `index`
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    /// Mutable entry at slot `index`
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Entry keyed by `key`
    pub fn lookup(&self, key: usize) -> Option<&T> {
        self.find(key).and_then(|index| self.get(index))
    }

    /// Place `entry` in the first free slot along its probe sequence.
    pub fn insert(&mut self, entry: T) -> Result<usize, ProbeError> {
        if self.slots.is_empty() {
            return Err(ProbeError::Full);
        }
        let home = self.home(entry.key());
        let size = self.slots.len();
        let (displacement, index) = (0..size)
            .map(|displacement| (displacement, (home + displacement) % size))
            .find(|&(_, index)| self.slots[index].is_none())
            .ok_or(ProbeError::Full)?;
        self.slots[index] = Some(entry);
        self.len += 1;
        self.max_displacement = self.max_displacement.max(displacement);
        Ok(index)
    }

    /// Empty slot `index` without moving any other entry.
    pub fn vacate(&mut self, index: usize) -> Option<T> {
        let entry = self.slots.get_mut(index)?.take()?;
        self.len -= 1;
        Some(entry)
    }

    /// Remove the entry at slot `index`, then re-place the entries that
    /// follow it until an empty slot is reached.
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        let removed = self.vacate(index)?;
        let size = self.slots.len();
        let mut next = (index + 1) % size;
        while next != index {
            let Some(entry) = self.slots[next].take() else {
                break;
            };
            self.len -= 1;
            // Cannot fail: the slot just vacated is free.
            let _ = self.insert(entry);
            next = (next + 1) % size;
        }
        Some(removed)
    }

    /// Remove the entry keyed by `key`, shifting followers
    pub fn remove(&mut self, key: usize) -> Option<T> {
        let index = self.find(key)?;
        self.remove_at(index)
    }

    /// Rebuild with `size` slots, re-placing every entry.
    pub fn resize(&mut self, size: usize) -> Result<(), ProbeError> {
        let old = std::mem::replace(self, Self::with_size(size));
        for entry in old.slots.into_iter().flatten() {
            self.insert(entry)?;
        }
        Ok(())
    }

    /// Live entries with their slot indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index, entry)))
    }

    /// Largest displacement of any live entry, computed by walking the table
    pub fn true_max_displacement(&self) -> usize {
        let size = self.slots.len();
        self.iter()
            .map(|(index, entry)| (index + size - self.home(entry.key())) % size)
            .max()
            .unwrap_or(0)
    }
}

impl<T: ProbeEntry> Default for ProbeTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
