//! Global marking
//!
//! Conservative: any word equal to the start of an allocated global block
//! keeps that block alive. Interior pointers do not.
//!
//! In a generational pass old blocks are live by definition and are not
//! traced; instead the dirty-card ranges of old blocks are scanned for
//! pointers to young blocks.

use super::Zone;
use crate::heap::{self, Block, BlockFlags};
use crate::host::WordRange;
use crate::thread::Thread;
use std::sync::Arc;

pub(crate) struct Marker<'a> {
    zone: &'a Zone,
    generational: bool,
    worklist: Vec<usize>,
    marked: usize,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(zone: &'a Zone, generational: bool) -> Self {
        Self {
            zone,
            generational,
            worklist: Vec::new(),
            marked: 0,
        }
    }

    /// Blocks marked so far
    pub(crate) fn marked(&self) -> usize {
        self.marked
    }

    fn push(&mut self, addr: usize) {
        if self.worklist.try_reserve(1).is_err() {
            self.zone.host().fatal("cannot grow the mark stack");
        }
        self.worklist.push(addr);
    }

    /// Candidate test for one conservatively scanned word.
    fn mark(&mut self, value: usize) {
        if value == 0 || !self.zone.heap.contains(value) {
            return;
        }
        let Some(block) = self.zone.heap.block(value) else {
            return;
        };
        let meta = block.meta();
        if meta.test(BlockFlags::THREAD_LOCAL) {
            return;
        }
        if self.generational && meta.age() == 0 {
            return;
        }
        if meta.test_and_set(BlockFlags::MARKED) {
            return;
        }
        self.marked += 1;
        self.push(value);
    }

    fn scan_range(&mut self, range: WordRange) {
        // SAFETY: stack ranges stay readable while published; root slots
        // while registered.
        unsafe { heap::for_each_word(range.start, range.end, |word| self.mark(word)) }
    }

    /// Root slots, retained blocks, thread stacks, thread locals, and in a
    /// generational pass the dirty cards of old blocks.
    pub(crate) fn mark_roots(&mut self, threads: &[Arc<Thread>]) {
        let zone = self.zone;
        for slot in zone.roots() {
            // SAFETY: registered roots are readable until removed.
            let value = unsafe { heap::load_word(slot) };
            self.mark(value);
        }

        let mut retained = Vec::new();
        let mut dirty_old: Vec<Block<'a>> = Vec::new();
        zone.heap.for_each_block(|block| {
            let meta = block.meta();
            if meta.test(BlockFlags::THREAD_LOCAL) {
                return;
            }
            if meta.refcount() > 0 {
                retained.push(block.address());
            }
            if self.generational && meta.age() == 0 {
                dirty_old.push(block);
            }
        });
        for addr in retained {
            self.mark(addr);
        }
        for block in dirty_old {
            if !block.layout().is_scanned() {
                continue;
            }
            for (start, end) in block.dirty_ranges() {
                self.scan_range(WordRange::new(start, end));
            }
        }

        self.scan_stacks(threads);

        for thread in threads {
            let locals = thread.locals().addresses();
            for addr in locals {
                let is_local = zone.heap.block(addr).is_some_and(|block| {
                    block.flags().contains(BlockFlags::THREAD_LOCAL)
                        && !block.flags().contains(BlockFlags::LOCAL_DEAD)
                });
                if is_local {
                    self.push(addr);
                }
            }
        }
    }

    /// Conservatively scan every thread's root ranges
    pub(crate) fn scan_stacks(&mut self, threads: &[Arc<Thread>]) {
        for thread in threads {
            for range in self.zone.stacks().ranges(thread) {
                self.scan_range(range);
            }
        }
    }

    /// Push blocks enlivened by the write barrier, returning how many.
    pub(crate) fn take_enlivened(&mut self, threads: &[Arc<Thread>]) -> usize {
        let mut taken = std::mem::take(&mut *self.zone.enliven_queue.lock());
        for thread in threads {
            taken.append(&mut thread.enliven_queue.lock());
        }
        let count = taken.len();
        self.marked += count;
        for addr in taken {
            self.push(addr);
        }
        count
    }

    /// Trace until the worklist is empty.
    pub(crate) fn trace(&mut self) {
        let zone = self.zone;
        while let Some(addr) = self.worklist.pop() {
            let Some(block) = zone.heap.block(addr) else {
                continue;
            };
            let old = block.meta().age() == 0;
            zone.for_each_pointer(&block, |slot, value| {
                self.mark(value);
                if old && !self.generational {
                    let young = zone
                        .heap
                        .block(value)
                        .is_some_and(|target| target.meta().age() > 0);
                    if young {
                        block.dirty_card(slot);
                    }
                }
            });
        }
    }
}
