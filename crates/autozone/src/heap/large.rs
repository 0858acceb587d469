//! Individually allocated blocks at or above the large threshold

use super::layout::{BlockAttrs, QuantumMeta};
use crate::defaults::PAGE_SIZE;
use crate::sync::{RwLock, WriteGuard};
use crate::{ZoneError, ZoneResult};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One page-aligned large block.
///
/// The memory is released when the last `Arc` drops, so a marker holding
/// a reference can keep reading after the block has been freed.
pub struct LargeBlock {
    address: usize,
    size: usize,
    layout: Layout,
    meta: QuantumMeta,
    dirty: AtomicBool,
}

impl LargeBlock {
    fn allocate(size: usize) -> Option<Self> {
        let rounded = size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
        let layout = Layout::from_size_align(rounded, PAGE_SIZE).ok()?;
        // SAFETY: non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self {
            address: ptr as usize,
            size: rounded,
            layout,
            meta: QuantumMeta::default(),
            dirty: AtomicBool::new(false),
        })
    }

    /// First address
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block metadata
    #[inline]
    pub fn meta(&self) -> &QuantumMeta {
        &self.meta
    }

    /// True if `addr` points into the block
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.address) < self.size
    }

    /// Record a store into this block for the generational collector
    pub fn dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// True if any store was recorded since the last clear
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Forget recorded stores
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

impl Drop for LargeBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this layout.
        unsafe { std::alloc::dealloc(self.address as *mut u8, self.layout) }
    }
}

impl std::fmt::Debug for LargeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeBlock")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("flags", &self.meta.flags())
            .finish()
    }
}

/// Map of live large blocks keyed by address.
#[derive(Default)]
pub struct LargeStore {
    blocks: RwLock<BTreeMap<usize, Arc<LargeBlock>>>,
    bytes: AtomicUsize,
}

impl LargeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a large block. `marked` is evaluated under the store lock.
    pub fn allocate(
        &self,
        size: usize,
        attrs: BlockAttrs,
        marked: impl FnOnce() -> bool,
    ) -> ZoneResult<usize> {
        let block = LargeBlock::allocate(size).ok_or(ZoneError::Exhausted { size })?;
        let address = block.address;
        let bytes = block.size;
        let mut blocks = self.blocks.write();
        block.meta.init_block(1, attrs, marked());
        blocks.insert(address, Arc::new(block));
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(address)
    }

    /// Block starting exactly at `addr`
    pub fn get(&self, addr: usize) -> Option<Arc<LargeBlock>> {
        self.blocks.read().get(&addr).cloned()
    }

    /// Block containing `addr`
    pub fn containing(&self, addr: usize) -> Option<Arc<LargeBlock>> {
        let blocks = self.blocks.read();
        let (_, block) = blocks.range(..=addr).next_back()?;
        block.contains(addr).then(|| block.clone())
    }

    /// Remove the block starting at `addr`
    pub fn remove(&self, addr: usize) -> Option<Arc<LargeBlock>> {
        let removed = self.blocks.write().remove(&addr);
        self.account_removed(removed)
    }

    /// Remove the block starting at `addr` while the write lock is held
    pub fn remove_locked(
        &self,
        blocks: &mut WriteGuard<'_, BTreeMap<usize, Arc<LargeBlock>>>,
        addr: usize,
    ) -> Option<Arc<LargeBlock>> {
        let removed = blocks.remove(&addr);
        self.account_removed(removed)
    }

    fn account_removed(&self, removed: Option<Arc<LargeBlock>>) -> Option<Arc<LargeBlock>> {
        if let Some(block) = &removed {
            self.bytes.fetch_sub(block.size, Ordering::Relaxed);
        }
        removed
    }

    /// Exclusive access for the sweep
    pub fn write(&self) -> WriteGuard<'_, BTreeMap<usize, Arc<LargeBlock>>> {
        self.blocks.write()
    }

    /// Snapshot of every live block
    pub fn snapshot(&self) -> Vec<Arc<LargeBlock>> {
        self.blocks.read().values().cloned().collect()
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// True if no large block is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by live blocks
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}
