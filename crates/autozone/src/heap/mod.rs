//! Managed memory
//!
//! Small and medium blocks live in 1 MiB subzones carved from a single
//! reservation and are handed out by the eight admins of the
//! [`SubzonePartition`]. Large blocks are allocated individually and kept in
//! the [`LargeStore`]. Per-block collector state lives in side-table
//! [`QuantumMeta`] records, never inside the block itself, so block contents
//! are entirely the mutator's.
//!
//! Block memory is only ever touched through word-sized atomic loads and
//! stores: collectors scan memory that mutators are concurrently writing.

mod admin;
mod large;
mod layout;
mod partition;
mod region;
mod subzone;

pub use admin::{Admin, AdminState};
pub use large::{LargeBlock, LargeStore};
pub use layout::{BlockAttrs, BlockFlags, BlockLayout, QuantumMeta, SizeClass};
pub use partition::{PartitionGuard, SubzonePartition, ADMIN_COUNT};
pub use region::Region;
pub use subzone::Subzone;

pub(crate) use region::zero;

use crate::defaults::LARGE_SIZE_THRESHOLD;
use crate::ZoneResult;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Word size in bytes
pub const WORD: usize = size_of::<usize>();

/// Load one word of managed memory.
///
/// # Safety
/// `addr` must be word aligned and lie in memory owned by the heap
/// (or kept alive by a held `Arc<LargeBlock>`).
#[inline]
pub unsafe fn load_word(addr: usize) -> usize {
    (*(addr as *const AtomicUsize)).load(Ordering::Relaxed)
}

/// Store one word of managed memory.
///
/// # Safety
/// Same contract as [`load_word`].
#[inline]
pub unsafe fn store_word(addr: usize, value: usize) {
    (*(addr as *const AtomicUsize)).store(value, Ordering::Release)
}

/// Reference to one allocated block.
#[derive(Clone)]
pub enum Block<'a> {
    /// Small or medium block inside a subzone
    Quantum {
        /// Owning subzone
        subzone: &'a Subzone,
        /// Start quantum
        index: usize,
    },
    /// Individually allocated block
    Large(Arc<LargeBlock>),
}

impl Block<'_> {
    /// First address
    pub fn address(&self) -> usize {
        match self {
            Block::Quantum { subzone, index } => subzone.quantum_address(*index),
            Block::Large(large) => large.address(),
        }
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        match self {
            Block::Quantum { subzone, index } => subzone.run_size(*index),
            Block::Large(large) => large.size(),
        }
    }

    /// Collector metadata
    pub fn meta(&self) -> &QuantumMeta {
        match self {
            Block::Quantum { subzone, index } => subzone.meta(*index),
            Block::Large(large) => large.meta(),
        }
    }

    /// Layout stamped at allocation
    pub fn layout(&self) -> BlockLayout {
        self.meta().layout()
    }

    /// Current flags
    pub fn flags(&self) -> BlockFlags {
        self.meta().flags()
    }

    /// True for large blocks
    pub fn is_large(&self) -> bool {
        matches!(self, Block::Large(_))
    }

    /// Owning admin, for small and medium blocks
    pub fn admin(&self) -> Option<usize> {
        match self {
            Block::Quantum { subzone, .. } => Some(subzone.admin()),
            Block::Large(_) => None,
        }
    }

    /// Record a store into `slot` for the generational collector
    pub fn dirty_card(&self, slot: usize) {
        match self {
            Block::Quantum { subzone, .. } => subzone.dirty_card(slot),
            Block::Large(large) => large.dirty(),
        }
    }

    /// Mark the whole block dirty
    pub fn dirty_all(&self) {
        match self {
            Block::Quantum { subzone, index } => subzone.dirty_block_cards(*index),
            Block::Large(large) => large.dirty(),
        }
    }

    /// Address ranges written since cards were last cleared
    pub fn dirty_ranges(&self) -> Vec<(usize, usize)> {
        match self {
            Block::Quantum { subzone, index } => subzone.dirty_ranges(*index),
            Block::Large(large) if large.is_dirty() => {
                vec![(large.address(), large.address() + large.size())]
            }
            Block::Large(_) => Vec::new(),
        }
    }

    /// Visit every word stored in the block
    pub fn for_each_word(&self, f: impl FnMut(usize)) {
        let start = self.address();
        // SAFETY: the block is allocated; large memory is held by the Arc.
        unsafe { for_each_word(start, start + self.size(), f) }
    }

    /// Load the word at byte `offset`
    pub fn word(&self, offset: usize) -> usize {
        debug_assert!(offset + WORD <= self.size());
        // SAFETY: in bounds of an allocated block.
        unsafe { load_word(self.address() + offset) }
    }
}

impl std::fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size())
            .field("flags", &self.flags())
            .field("layout", &self.layout())
            .finish()
    }
}

/// Visit every word in `[start, end)`.
///
/// # Safety
/// The range must be readable for its whole length.
pub unsafe fn for_each_word(start: usize, end: usize, mut f: impl FnMut(usize)) {
    let mut addr = (start + WORD - 1) & !(WORD - 1);
    while addr + WORD <= end {
        f(load_word(addr));
        addr += WORD;
    }
}

/// All managed memory of one zone.
pub struct Heap {
    /// Subzone reservation
    pub region: Region,
    /// Small and medium admins
    pub partition: SubzonePartition,
    /// Large blocks
    pub large: LargeStore,
}

impl Heap {
    /// Reserve the region and create empty admins
    pub fn new(region_size: usize) -> ZoneResult<Self> {
        Ok(Self {
            region: Region::new(region_size)?,
            partition: SubzonePartition::new(),
            large: LargeStore::new(),
        })
    }

    /// True if requests of `size` bytes bypass the subzones
    #[inline]
    pub fn is_large_size(size: usize) -> bool {
        size >= LARGE_SIZE_THRESHOLD
    }

    /// Coverage query: true if `addr` lies in managed memory
    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr) || self.large.containing(addr).is_some()
    }

    /// Allocated block starting exactly at `addr`
    pub fn block(&self, addr: usize) -> Option<Block<'_>> {
        if self.region.contains(addr) {
            let subzone = self.region.subzone_for(addr)?;
            let index = subzone.block_at(addr)?;
            return Some(Block::Quantum { subzone, index });
        }
        let large = self.large.get(addr)?;
        large.meta().test(BlockFlags::START).then_some(Block::Large(large))
    }

    /// Allocated block containing `addr` (interior pointers included)
    pub fn block_containing(&self, addr: usize) -> Option<Block<'_>> {
        if self.region.contains(addr) {
            let subzone = self.region.subzone_for(addr)?;
            let index = subzone.block_containing(addr)?;
            return Some(Block::Quantum { subzone, index });
        }
        self.large.containing(addr).map(Block::Large)
    }

    /// Visit every allocated block
    pub fn for_each_block<'a>(&'a self, mut f: impl FnMut(Block<'a>)) {
        for subzone in self.region.subzones() {
            subzone.for_each_block(|index, _| f(Block::Quantum { subzone, index }));
        }
        for large in self.large.snapshot() {
            f(Block::Large(large));
        }
    }

    /// Clear every card and large-block dirty bit
    pub fn clear_cards(&self) {
        for subzone in self.region.subzones() {
            subzone.clear_cards();
        }
        for large in self.large.snapshot() {
            large.clear_dirty();
        }
    }

    /// Return a block to its allocator outside of a collection.
    pub fn free(&self, block: Block<'_>, scribble: bool) {
        match block {
            Block::Quantum { subzone, index } => {
                let addr = subzone.quantum_address(index);
                self.partition
                    .admin_at(subzone.admin())
                    .free(&self.region, addr, scribble);
            }
            Block::Large(large) => {
                large.meta().clear_flags(BlockFlags::START);
                self.large.remove(large.address());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::SUBZONE_SIZE;

    fn attrs() -> BlockAttrs {
        BlockAttrs {
            layout: BlockLayout::SCANNED,
            thread_local: false,
            refcount_one: false,
        }
    }

    fn allocate(heap: &Heap, size: usize) -> usize {
        if Heap::is_large_size(size) {
            return heap.large.allocate(size, attrs(), || false).unwrap();
        }
        let class = SizeClass::for_size(size);
        heap.partition
            .admin(size, BlockLayout::SCANNED, false)
            .allocate(&heap.region, class.quanta_for(size), attrs(), || false)
            .unwrap()
    }

    #[test]
    fn test_block_lookup_across_classes() {
        let heap = Heap::new(4 * SUBZONE_SIZE).unwrap();
        let small = allocate(&heap, 48);
        let medium = allocate(&heap, 4000);
        let large = allocate(&heap, 200_000);
        assert_eq!(heap.block(small).unwrap().size(), 48);
        assert_eq!(heap.block(medium).unwrap().size(), 4096);
        assert!(heap.block(large).unwrap().is_large());
        assert_eq!(heap.block_containing(small + 40).unwrap().address(), small);
        assert_eq!(heap.block_containing(large + 4096).unwrap().address(), large);
        assert!(heap.block(small + 16).is_none());
        assert!(heap.contains(large + 10));
        assert!(!heap.contains(8));
    }

    #[test]
    fn test_words_roundtrip_through_block() {
        let heap = Heap::new(SUBZONE_SIZE).unwrap();
        let addr = allocate(&heap, 32);
        unsafe { store_word(addr + WORD, 77) };
        let block = heap.block(addr).unwrap();
        assert_eq!(block.word(WORD), 77);
        let mut words = Vec::new();
        block.for_each_word(|word| words.push(word));
        assert_eq!(words.len(), 32 / WORD);
        assert_eq!(words[1], 77);
    }

    #[test]
    fn test_free_and_walk() {
        let heap = Heap::new(SUBZONE_SIZE).unwrap();
        let a = allocate(&heap, 16);
        let b = allocate(&heap, 16);
        let big = allocate(&heap, 150_000);
        heap.free(heap.block(a).unwrap(), true);
        heap.free(heap.block(big).unwrap(), true);
        let mut seen = Vec::new();
        heap.for_each_block(|block| seen.push(block.address()));
        assert_eq!(seen, vec![b]);
    }
}
