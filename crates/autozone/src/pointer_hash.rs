//! Open-addressed pointer set with per-entry flags
//!
//! Backs each thread's set of thread-local blocks. Every entry is an
//! address plus a small flag set used by the thread-local collector to
//! record marking progress.
//!
//! Block addresses are quantum aligned, so their low bits carry nothing.
//! The home slot comes from the high bits of the multiplied hash instead.

use rustc_hash::FxHasher;
use std::hash::Hasher;

bitflags::bitflags! {
    /// Per-entry flags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LocalFlags: u8 {
        /// Reached by the current thread-local scan
        const MARKED = 1 << 0;
    }
}

/// One live entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocalEntry {
    /// Block address
    pub address: usize,
    /// Collector flags
    pub flags: LocalFlags,
}

#[derive(Copy, Clone, Debug)]
enum Slot {
    Empty,
    Removed,
    Occupied(LocalEntry),
    Pending(LocalEntry),
}

const MIN_CAPACITY: usize = 16;

/// Open-addressed set of block addresses.
#[derive(Debug)]
pub struct PointerHash {
    slots: Vec<Slot>,
    count: usize,
    removed: usize,
}

impl PointerHash {
    /// Create an empty set
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Create a set sized for roughly `entries` addresses
    pub fn with_capacity(entries: usize) -> Self {
        let capacity = (entries * 4 / 3 + 1).next_power_of_two().max(MIN_CAPACITY);
        Self {
            slots: vec![Slot::Empty; capacity],
            count: 0,
            removed: 0,
        }
    }

    /// Live entries
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// True if no entry is live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Allocated slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn home(&self, address: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(address);
        let bits = self.slots.len().trailing_zeros();
        hasher.finish() as usize >> (usize::BITS - bits)
    }

    /// Insert `address`. Returns false if it was already present.
    pub fn add(&mut self, address: usize) -> bool {
        if self.find(address).is_some() {
            return false;
        }
        if (self.count + self.removed + 1) * 4 > self.slots.len() * 3 {
            if self.removed > self.count {
                self.rehash();
            } else {
                self.resize(self.slots.len() * 2);
            }
        }
        let mask = self.slots.len() - 1;
        let mut index = self.home(address);
        loop {
            match self.slots[index] {
                Slot::Empty => break,
                Slot::Removed => {
                    self.removed -= 1;
                    break;
                }
                _ => index = (index + 1) & mask,
            }
        }
        self.slots[index] = Slot::Occupied(LocalEntry {
            address,
            flags: LocalFlags::empty(),
        });
        self.count += 1;
        true
    }

    /// Slot index holding `address`
    pub fn find(&self, address: usize) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut index = self.home(address);
        for _ in 0..self.slots.len() {
            match self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied(entry) if entry.address == address => return Some(index),
                _ => index = (index + 1) & mask,
            }
        }
        None
    }

    /// True if `address` is present
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.find(address).is_some()
    }

    /// Remove `address`. Returns false if it was absent.
    pub fn remove(&mut self, address: usize) -> bool {
        match self.find(address) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Remove the entry at slot `index`
    pub fn remove_at(&mut self, index: usize) {
        if let Slot::Occupied(_) = self.slots[index] {
            self.slots[index] = Slot::Removed;
            self.count -= 1;
            self.removed += 1;
        }
    }

    /// Entry at slot `index`
    pub fn entry(&self, index: usize) -> Option<LocalEntry> {
        match self.slots[index] {
            Slot::Occupied(entry) => Some(entry),
            _ => None,
        }
    }

    /// Flags of `address`, if present
    pub fn flags(&self, address: usize) -> Option<LocalFlags> {
        self.find(address)
            .and_then(|index| self.entry(index))
            .map(|entry| entry.flags)
    }

    /// Set flags at slot `index`, returning the previous flags
    pub fn set_flags_at(&mut self, index: usize, flags: LocalFlags) -> LocalFlags {
        match &mut self.slots[index] {
            Slot::Occupied(entry) => {
                let prior = entry.flags;
                entry.flags |= flags;
                prior
            }
            _ => LocalFlags::empty(),
        }
    }

    /// Set `flags` on `address` if it is present and did not already carry all
    /// of them. Returns true only on that transition.
    pub fn test_and_set(&mut self, address: usize, flags: LocalFlags) -> bool {
        match self.find(address) {
            Some(index) => !self.set_flags_at(index, flags).contains(flags),
            None => false,
        }
    }

    /// Clear every entry's flags
    pub fn clear_all_flags(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Occupied(entry) = slot {
                entry.flags = LocalFlags::empty();
            }
        }
    }

    /// Live entries with their slot indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, LocalEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(entry) => Some((index, *entry)),
                _ => None,
            })
    }

    /// Addresses of every live entry
    pub fn addresses(&self) -> Vec<usize> {
        self.iter().map(|(_, entry)| entry.address).collect()
    }

    /// Count of entries carrying all of `flags`
    pub fn count_with(&self, flags: LocalFlags) -> usize {
        self.iter()
            .filter(|(_, entry)| entry.flags.contains(flags))
            .count()
    }

    /// Drop every entry, keeping the allocation
    pub fn clear(&mut self) {
        self.slots.fill(Slot::Empty);
        self.count = 0;
        self.removed = 0;
    }

    /// Re-place every entry without allocating, dropping tombstones.
    pub fn rehash(&mut self) {
        for slot in &mut self.slots {
            *slot = match *slot {
                Slot::Occupied(entry) => Slot::Pending(entry),
                _ => Slot::Empty,
            };
        }
        self.removed = 0;
        let mask = self.slots.len() - 1;
        for start in 0..self.slots.len() {
            let Slot::Pending(mut entry) = self.slots[start] else {
                continue;
            };
            self.slots[start] = Slot::Empty;
            let mut index = self.home(entry.address);
            loop {
                match self.slots[index] {
                    Slot::Empty => {
                        self.slots[index] = Slot::Occupied(entry);
                        break;
                    }
                    Slot::Pending(displaced) => {
                        self.slots[index] = Slot::Occupied(entry);
                        entry = displaced;
                        index = self.home(entry.address);
                    }
                    _ => index = (index + 1) & mask,
                }
            }
        }
    }

    /// Rebuild at a size matching the live count; may shrink the allocation.
    pub fn compact(&mut self) {
        let target = (self.count * 2).next_power_of_two().max(MIN_CAPACITY);
        if target < self.slots.len() {
            self.resize(target);
        } else if self.removed > 0 {
            self.rehash();
        }
    }

    fn resize(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; capacity]);
        self.removed = 0;
        let mask = capacity - 1;
        for slot in old {
            if let Slot::Occupied(entry) = slot {
                let mut index = self.home(entry.address);
                while let Slot::Occupied(_) = self.slots[index] {
                    index = (index + 1) & mask;
                }
                self.slots[index] = Slot::Occupied(entry);
            }
        }
    }
}

impl Default for PointerHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_find_remove() {
        let mut hash = PointerHash::new();
        assert!(hash.add(0x1000));
        assert!(!hash.add(0x1000));
        assert!(hash.contains(0x1000));
        assert_eq!(hash.count(), 1);
        assert!(hash.remove(0x1000));
        assert!(!hash.remove(0x1000));
        assert!(hash.is_empty());
    }

    #[test]
    fn test_growth_keeps_entries() {
        let mut hash = PointerHash::new();
        for i in 0..1000 {
            hash.add(0x10_0000 + i * 16);
        }
        assert_eq!(hash.count(), 1000);
        assert!(hash.capacity() >= 1334);
        for i in 0..1000 {
            assert!(hash.contains(0x10_0000 + i * 16));
        }
    }

    #[test]
    fn test_flags() {
        let mut hash = PointerHash::new();
        hash.add(0x40);
        assert!(hash.test_and_set(0x40, LocalFlags::MARKED));
        assert!(!hash.test_and_set(0x40, LocalFlags::MARKED));
        assert!(!hash.test_and_set(0x80, LocalFlags::MARKED));
        let index = hash.find(0x40).unwrap();
        assert_eq!(hash.set_flags_at(index, LocalFlags::MARKED), LocalFlags::MARKED);
        assert_eq!(hash.flags(0x40), Some(LocalFlags::MARKED));
        assert_eq!(hash.count_with(LocalFlags::MARKED), 1);
        hash.clear_all_flags();
        assert_eq!(hash.flags(0x40), Some(LocalFlags::empty()));
    }

    #[test]
    fn test_rehash_in_place_drops_tombstones() {
        let mut hash = PointerHash::new();
        for i in 0..12 {
            hash.add(0x2000 + i * 16);
        }
        for i in 0..12 {
            if i % 2 == 0 {
                hash.remove(0x2000 + i * 16);
            }
        }
        let capacity = hash.capacity();
        hash.rehash();
        assert_eq!(hash.capacity(), capacity);
        assert_eq!(hash.count(), 6);
        for i in 0..12 {
            assert_eq!(hash.contains(0x2000 + i * 16), i % 2 == 1);
        }
    }

    #[test]
    fn test_compact_shrinks() {
        let mut hash = PointerHash::new();
        for i in 0..500 {
            hash.add(0x8000 + i * 32);
        }
        for i in 0..495 {
            hash.remove(0x8000 + i * 32);
        }
        hash.compact();
        assert_eq!(hash.capacity(), MIN_CAPACITY);
        for i in 495..500 {
            assert!(hash.contains(0x8000 + i * 32));
        }
    }

    #[test]
    fn test_many_removes_do_not_fill_table() {
        let mut hash = PointerHash::new();
        for round in 0..100 {
            let address = 0x1_0000 + round * 16;
            hash.add(address);
            hash.remove(address);
        }
        assert!(hash.capacity() <= 32);
        assert!(hash.find(0xdead0).is_none());
    }

    fn probe_lengths(hash: &PointerHash) -> (usize, usize) {
        let size = hash.capacity();
        let (mut total, mut worst) = (0, 0);
        for (index, entry) in hash.iter() {
            let distance = (index + size - hash.home(entry.address)) % size;
            total += distance;
            worst = worst.max(distance);
        }
        (total / hash.count(), worst)
    }

    #[test]
    fn test_aligned_addresses_spread_over_slots() {
        for stride in [16usize, 256] {
            let mut hash = PointerHash::new();
            for i in 0..1000 {
                hash.add(0x7f00_0000_0000 + i * stride);
            }
            let homes: std::collections::HashSet<usize> =
                hash.iter().map(|(_, entry)| hash.home(entry.address)).collect();
            assert!(homes.len() > hash.capacity() / 4, "stride {stride}: {} homes", homes.len());

            let (average, worst) = probe_lengths(&hash);
            assert!(average <= 2, "stride {stride}: average probe {average}");
            assert!(worst < 32, "stride {stride}: worst probe {worst}");
        }
    }
}
