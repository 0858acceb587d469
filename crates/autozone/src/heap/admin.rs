//! Free-list and bump allocator for one partition bucket

use super::layout::{BlockAttrs, BlockFlags, SizeClass};
use super::region::{self, Region};
use super::subzone::Subzone;
use crate::defaults::{FREE_LIST_COUNT, PAGE_SIZE};
use crate::sync::{SpinGuard, SpinLock};

/// Allocator for one (size class, scanned, retained) bucket.
pub struct Admin {
    index: usize,
    state: SpinLock<AdminState>,
}

/// Admin state, only reachable through the admin's spin lock.
pub struct AdminState {
    index: usize,
    class: SizeClass,
    free_lists: Vec<Vec<usize>>,
    active: Option<Cursor>,
    subzones: Vec<usize>,
    free_quanta: usize,
}

#[derive(Clone, Copy)]
struct Cursor {
    base: usize,
    next: usize,
}

impl Admin {
    pub(super) fn new(index: usize, class: SizeClass) -> Self {
        Self {
            index,
            state: SpinLock::new(AdminState {
                index,
                class,
                free_lists: vec![Vec::new(); FREE_LIST_COUNT + 1],
                active: None,
                subzones: Vec::new(),
                free_quanta: 0,
            }),
        }
    }

    /// Position in the partition
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Acquire the admin lock
    pub fn lock(&self) -> SpinGuard<'_, AdminState> {
        self.state.lock()
    }

    /// Non-blocking probe of the admin lock
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Allocate `quanta` quanta and stamp the block.
    ///
    /// `marked` is evaluated while the admin lock is held.
    pub fn allocate(
        &self,
        region: &Region,
        quanta: u32,
        attrs: BlockAttrs,
        marked: impl FnOnce() -> bool,
    ) -> Option<usize> {
        let mut state = self.state.lock();
        state.allocate(region, quanta, attrs, marked())
    }

    /// Return a block to this admin's free lists.
    pub fn free(&self, region: &Region, addr: usize, scribble: bool) {
        self.state.lock().free(region, addr, scribble);
    }

    /// Release the physical pages of free runs, returning bytes purged.
    pub fn purge_free_space(&self, region: &Region) -> usize {
        self.state.lock().purge_free_space(region)
    }
}

impl AdminState {
    /// Size class served
    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Subzones owned by this admin
    pub fn subzone_count(&self) -> usize {
        self.subzones.len()
    }

    /// Free quanta held on the free lists
    pub fn free_quanta(&self) -> usize {
        self.free_quanta
    }

    /// Allocate with the lock already held.
    pub fn allocate(
        &mut self,
        region: &Region,
        quanta: u32,
        attrs: BlockAttrs,
        marked: bool,
    ) -> Option<usize> {
        debug_assert!(quanta as usize <= self.class.max_quanta());
        let addr = self
            .take_exact(quanta)
            .or_else(|| self.bump(region, quanta))
            .or_else(|| self.split_larger(region, quanta))?;
        let subzone = region.subzone_for(addr)?;
        subzone
            .meta(subzone.quantum_index(addr))
            .init_block(quanta, attrs, marked);
        Some(addr)
    }

    /// Free with the lock already held.
    pub fn free(&mut self, region: &Region, addr: usize, scribble: bool) {
        let Some(subzone) = region.subzone_for(addr) else {
            return;
        };
        debug_assert_eq!(subzone.admin(), self.index);
        let index = subzone.quantum_index(addr);
        let meta = subzone.meta(index);
        let quanta = meta.quanta();
        if scribble {
            region::zero(addr, subzone.run_size(index));
        }
        meta.init_free(quanta, false);
        self.push_free(addr, quanta);
    }

    /// Purge with the lock already held.
    pub fn purge_free_space(&mut self, region: &Region) -> usize {
        let mut purged = 0;
        for list in &self.free_lists {
            for &addr in list {
                let Some(subzone) = region.subzone_for(addr) else {
                    continue;
                };
                let meta = subzone.meta(subzone.quantum_index(addr));
                if meta.test(BlockFlags::PURGED) {
                    continue;
                }
                let end = addr + ((meta.quanta() as usize) << subzone.quantum_shift());
                let first_page = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                let last_page = end & !(PAGE_SIZE - 1);
                if last_page > first_page {
                    region.purge(first_page, last_page - first_page);
                    purged += last_page - first_page;
                }
                meta.set(BlockFlags::PURGED);
            }
        }
        purged
    }

    fn list_for(quanta: u32) -> usize {
        (quanta as usize).min(FREE_LIST_COUNT)
    }

    fn push_free(&mut self, addr: usize, quanta: u32) {
        self.free_lists[Self::list_for(quanta)].push(addr);
        self.free_quanta += quanta as usize;
    }

    fn take_exact(&mut self, quanta: u32) -> Option<usize> {
        let list = Self::list_for(quanta);
        if list < FREE_LIST_COUNT {
            let addr = self.free_lists[list].pop()?;
            self.free_quanta -= quanta as usize;
            return Some(addr);
        }
        None
    }

    fn bump(&mut self, region: &Region, quanta: u32) -> Option<usize> {
        let quanta = quanta as usize;
        if let Some(cursor) = self.active {
            let subzone = region.subzone_for(cursor.base)?;
            if cursor.next + quanta <= subzone.quantum_count() {
                return Some(self.advance(subzone, cursor, quanta));
            }
        }
        let subzone = region.carve(self.class, self.index)?;
        self.retire_active(region);
        self.subzones.push(subzone.base());
        let cursor = Cursor {
            base: subzone.base(),
            next: 0,
        };
        Some(self.advance(subzone, cursor, quanta))
    }

    fn advance(&mut self, subzone: &Subzone, cursor: Cursor, quanta: usize) -> usize {
        let addr = subzone.quantum_address(cursor.next);
        let next = cursor.next + quanta;
        subzone.advance_high_water(next);
        self.active = Some(Cursor { next, ..cursor });
        addr
    }

    /// Move the unused tail of the active subzone onto the free lists.
    fn retire_active(&mut self, region: &Region) {
        let Some(cursor) = self.active.take() else {
            return;
        };
        let Some(subzone) = region.subzone_for(cursor.base) else {
            return;
        };
        let max = self.class.max_quanta();
        let mut index = cursor.next;
        while index < subzone.quantum_count() {
            let quanta = max.min(subzone.quantum_count() - index);
            subzone.meta(index).init_free(quanta as u32, false);
            self.push_free(subzone.quantum_address(index), quanta as u32);
            index += quanta;
        }
        subzone.advance_high_water(subzone.quantum_count());
    }

    fn split_larger(&mut self, region: &Region, quanta: u32) -> Option<usize> {
        let (list, position) = (Self::list_for(quanta)..=FREE_LIST_COUNT).find_map(|list| {
            self.free_lists[list]
                .iter()
                .rposition(|&addr| run_quanta(region, addr) >= quanta)
                .map(|position| (list, position))
        })?;
        let addr = self.free_lists[list].swap_remove(position);
        let subzone = region.subzone_for(addr)?;
        let total = subzone.meta(subzone.quantum_index(addr)).quanta();
        self.free_quanta -= total as usize;
        let rest = total - quanta;
        if rest > 0 {
            let rest_addr = addr + ((quanta as usize) << subzone.quantum_shift());
            subzone
                .meta(subzone.quantum_index(rest_addr))
                .init_free(rest, false);
            self.push_free(rest_addr, rest);
        }
        Some(addr)
    }
}

fn run_quanta(region: &Region, addr: usize) -> u32 {
    region
        .subzone_for(addr)
        .map(|subzone| subzone.meta(subzone.quantum_index(addr)).quanta())
        .unwrap_or(0)
}
