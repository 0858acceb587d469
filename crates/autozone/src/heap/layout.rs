//! Block layout, per-block flags, and the metadata record kept for each quantum

use crate::defaults::{
    AGE_NEW, LARGE_SIZE_THRESHOLD, MEDIUM_QUANTUM_SHIFT, SMALL_QUANTUM_SHIFT, SMALL_SIZE_LIMIT,
};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

bitflags::bitflags! {
    /// Allocation layout requested by the embedder.
    ///
    /// The empty set is scanned, non-object memory.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BlockLayout: u8 {
        /// Contents are never scanned for pointers
        const UNSCANNED = 1 << 0;
        /// Block holds a host object
        const OBJECT    = 1 << 1;
    }
}

impl BlockLayout {
    /// Scanned, non-object memory
    pub const SCANNED: Self = Self::empty();

    /// True if the collectors must look inside the block
    #[inline]
    pub fn is_scanned(self) -> bool {
        !self.contains(Self::UNSCANNED)
    }
}

bitflags::bitflags! {
    /// Collector state of one block.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct BlockFlags: u16 {
        /// First quantum of an allocated block
        const START        = 1 << 0;
        /// First quantum of a free run (admin free list or thread cache)
        const FREE         = 1 << 1;
        /// Owned by a single thread; cleared once, when the block escapes
        const THREAD_LOCAL = 1 << 2;
        /// Reached by the global marker this cycle
        const MARKED       = 1 << 3;
        /// Must not move
        const PINNED       = 1 << 4;
        /// Found unreachable by the current global collection
        const GARBAGE      = 1 << 5;
        /// Resurrected after being declared garbage
        const ZOMBIE       = 1 << 6;
        /// Declared garbage by a thread-local collection
        const LOCAL_DEAD   = 1 << 7;
        /// Free run whose pages were returned to the system
        const PURGED       = 1 << 8;
    }
}

/// Size class served by the subzone admins.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// 16-byte quanta
    Small,
    /// 256-byte quanta
    Medium,
}

impl SizeClass {
    /// Size class for a request of `size` bytes below the large threshold
    #[inline]
    pub fn for_size(size: usize) -> Self {
        if size < SMALL_SIZE_LIMIT {
            SizeClass::Small
        } else {
            SizeClass::Medium
        }
    }

    /// log2 of the quantum size
    #[inline]
    pub fn quantum_shift(self) -> usize {
        match self {
            SizeClass::Small => SMALL_QUANTUM_SHIFT,
            SizeClass::Medium => MEDIUM_QUANTUM_SHIFT,
        }
    }

    /// Largest block of this class, in quanta
    #[inline]
    pub fn max_quanta(self) -> usize {
        match self {
            SizeClass::Small => SMALL_SIZE_LIMIT >> SMALL_QUANTUM_SHIFT,
            SizeClass::Medium => LARGE_SIZE_THRESHOLD >> MEDIUM_QUANTUM_SHIFT,
        }
    }

    /// Number of quanta needed for `size` bytes
    #[inline]
    pub fn quanta_for(self, size: usize) -> u32 {
        let shift = self.quantum_shift();
        ((size.max(1) + (1 << shift) - 1) >> shift) as u32
    }
}

/// Attributes stamped on a block at allocation time.
#[derive(Copy, Clone, Debug)]
pub struct BlockAttrs {
    /// Requested layout
    pub layout: BlockLayout,
    /// Allocated by a registered thread into its locals set
    pub thread_local: bool,
    /// Starts with a retain count of one
    pub refcount_one: bool,
}

/// Metadata record for one quantum (or one large block).
///
/// Only records for block-start or free-run-start quanta carry meaning.
#[derive(Debug, Default)]
pub struct QuantumMeta {
    flags: AtomicU16,
    layout: AtomicU8,
    age: AtomicU8,
    quanta: AtomicU32,
    refcount: AtomicU32,
}

impl QuantumMeta {
    /// Stamp an allocated block. `START` is published last.
    pub fn init_block(&self, quanta: u32, attrs: BlockAttrs, marked: bool) {
        self.quanta.store(quanta, Ordering::Relaxed);
        self.layout.store(attrs.layout.bits(), Ordering::Relaxed);
        self.age.store(AGE_NEW, Ordering::Relaxed);
        self.refcount
            .store(u32::from(attrs.refcount_one), Ordering::Relaxed);
        let mut flags = BlockFlags::START;
        if attrs.thread_local {
            flags |= BlockFlags::THREAD_LOCAL;
        }
        if marked {
            flags |= BlockFlags::MARKED;
        }
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Stamp the head of a free run
    pub fn init_free(&self, quanta: u32, purged: bool) {
        self.quanta.store(quanta, Ordering::Relaxed);
        self.refcount.store(0, Ordering::Relaxed);
        let mut flags = BlockFlags::FREE;
        if purged {
            flags |= BlockFlags::PURGED;
        }
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Forget this quantum entirely (interior of a merged or split run)
    pub fn clear(&self) {
        self.flags.store(0, Ordering::Release);
        self.quanta.store(0, Ordering::Relaxed);
    }

    /// Current flags
    #[inline]
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// True if every flag in `flags` is set
    #[inline]
    pub fn test(&self, flags: BlockFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Set flags
    #[inline]
    pub fn set(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear flags
    #[inline]
    pub fn clear_flags(&self, flags: BlockFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Set flags, returning whether all of them were already set
    #[inline]
    pub fn test_and_set(&self, flags: BlockFlags) -> bool {
        let prior = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        BlockFlags::from_bits_truncate(prior).contains(flags)
    }

    /// Clear flags, returning whether any of them were set
    #[inline]
    pub fn test_and_clear(&self, flags: BlockFlags) -> bool {
        let prior = self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        BlockFlags::from_bits_truncate(prior).intersects(flags)
    }

    /// Length of the block or free run in quanta
    #[inline]
    pub fn quanta(&self) -> u32 {
        self.quanta.load(Ordering::Acquire)
    }

    /// Layout stamped at allocation
    #[inline]
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::from_bits_truncate(self.layout.load(Ordering::Relaxed))
    }

    /// Replace the layout (used when a block is dropped to the global heap unscanned)
    pub fn set_layout(&self, layout: BlockLayout) {
        self.layout.store(layout.bits(), Ordering::Relaxed);
    }

    /// Generational age; 0 is old
    #[inline]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    /// Age by one collection, returning true when the block just became old
    pub fn mature(&self) -> bool {
        let age = self.age();
        if age == 0 {
            return false;
        }
        self.age.store(age - 1, Ordering::Relaxed);
        age == 1
    }

    /// Retain count
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the retain count, returning the new count
    pub fn retain(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the retain count (saturating at zero), returning the new count
    pub fn release(&self) -> u32 {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(SizeClass::for_size(16), SizeClass::Small);
        assert_eq!(SizeClass::for_size(1023), SizeClass::Small);
        assert_eq!(SizeClass::for_size(1024), SizeClass::Medium);
        assert_eq!(SizeClass::Small.quanta_for(0), 1);
        assert_eq!(SizeClass::Small.quanta_for(17), 2);
        assert_eq!(SizeClass::Medium.quanta_for(1024), 4);
    }

    #[test]
    fn test_init_block_publishes_flags() {
        let meta = QuantumMeta::default();
        let attrs = BlockAttrs {
            layout: BlockLayout::OBJECT,
            thread_local: true,
            refcount_one: true,
        };
        meta.init_block(4, attrs, false);
        assert!(meta.test(BlockFlags::START | BlockFlags::THREAD_LOCAL));
        assert!(!meta.test(BlockFlags::MARKED));
        assert_eq!(meta.quanta(), 4);
        assert_eq!(meta.refcount(), 1);
        assert_eq!(meta.age(), AGE_NEW);
        assert!(meta.layout().is_scanned());
    }

    #[test]
    fn test_test_and_set() {
        let meta = QuantumMeta::default();
        assert!(!meta.test_and_set(BlockFlags::MARKED));
        assert!(meta.test_and_set(BlockFlags::MARKED));
        assert!(meta.test_and_clear(BlockFlags::MARKED));
        assert!(!meta.test(BlockFlags::MARKED));
    }

    #[test]
    fn test_release_saturates() {
        let meta = QuantumMeta::default();
        assert_eq!(meta.release(), 0);
        assert_eq!(meta.retain(), 1);
        assert_eq!(meta.release(), 0);
    }

    #[test]
    fn test_mature_reports_transition() {
        let meta = QuantumMeta::default();
        meta.init_block(1, BlockAttrs { layout: BlockLayout::SCANNED, thread_local: false, refcount_one: false }, false);
        let mut became_old = 0;
        for _ in 0..(AGE_NEW as usize + 2) {
            if meta.mature() {
                became_old += 1;
            }
        }
        assert_eq!(became_old, 1);
        assert_eq!(meta.age(), 0);
    }
}
