//! Thread-local collection
//!
//! A thread-local collection (TLC) reclaims blocks that never escaped the
//! thread that allocated them, without stopping or synchronizing with any
//! other mutator:
//!
//! 1. Scan the thread's published stack ranges for block starts that are
//!    thread-local members of this thread's locals set, marking them.
//! 2. Compute the closure: scan the contents of every marked block for
//!    further locals.
//! 3. Every unmarked local is garbage and leaves the locals set.
//! 4. Rehash (suspended thread) or compact the locals set.
//! 5. Finalize the garbage now, later on the collector thread, or hand it
//!    to the next global collection when the thread is suspended.
//!
//! Marking state lives in the locals set flags, never in block metadata, so
//! a TLC can overlap a global collection.

use crate::heap::{self, Block, BlockFlags, BlockLayout, WORD};
use crate::host::WordRange;
use crate::pointer_hash::{LocalFlags, PointerHash};
use crate::thread::{Thread, TlcState};
use crate::zone::{CollectionTask, Zone};
use crate::{ZoneError, ZoneResult};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// How a thread-local collection disposes of its garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    /// Invalidate and scavenge on the calling thread
    Now,
    /// Hand the garbage to the collector thread for finalization
    Later,
    /// The owning thread is suspended; leave the garbage to the global collector
    Suspended,
}

/// Result of one thread-local collection.
#[derive(Debug, Clone, Default)]
pub struct TlcOutcome {
    /// Locals found reachable
    pub marked: usize,
    /// Locals found unreachable, each listed once
    pub garbage: Vec<usize>,
    /// Reachable locals referenced from garbage and made global
    pub evicted: usize,
    /// Garbage returned to the thread cache
    pub scavenged: usize,
    /// Garbage left for the global collector because the cache was full
    pub dropped: usize,
    /// Garbage kept alive by retains or resurrection
    pub retained: usize,
    /// Every remaining local was made global afterwards
    pub flushed: bool,
    /// Wall time
    pub duration: Duration,
}

/// Whether `thread` should run a thread-local collection now.
///
/// `can_finalize` says whether the calling path may run finalization
/// itself; without it the collection only fires once the locals set is
/// full and the garbage goes to the collector thread.
pub fn should_collect(zone: &Zone, thread: &Thread, can_finalize: bool) -> bool {
    if !zone.config().thread_local_collection || thread.tlc_state() != TlcState::Idle {
        return false;
    }
    let count = thread.local_count();
    let limit = zone.config().local_allocations_size_limit;
    (can_finalize && count >= limit / 10) || count >= limit
}

/// Watchdog variant of [`should_collect`] for suspended threads.
///
/// Disarms the watchdog when it fires; otherwise tickles it.
pub fn should_collect_suspended(zone: &Zone, thread: &Thread) -> bool {
    let triggered = !zone.is_stack_logging()
        && !thread.locals_guard.is_guarded()
        && thread.tlc_state() == TlcState::Idle
        && thread
            .locals
            .try_lock()
            .is_some_and(|locals| !locals.is_empty());
    if triggered {
        thread.watchdog.disarm();
    } else {
        thread.watchdog.tickle();
    }
    triggered
}

/// One thread-local collection over one thread.
pub(crate) struct ThreadLocalCollector<'a> {
    zone: &'a Zone,
    thread: &'a Thread,
    mode: FinalizeMode,
    worklist: Vec<usize>,
}

impl<'a> ThreadLocalCollector<'a> {
    pub(crate) fn new(zone: &'a Zone, thread: &'a Thread, mode: FinalizeMode) -> Self {
        Self {
            zone,
            thread,
            mode,
            worklist: Vec::new(),
        }
    }

    pub(crate) fn collect(mut self) -> ZoneResult<TlcOutcome> {
        if self.thread.in_collector.is_guarded() || self.thread.locals_guard.is_guarded() {
            return Err(ZoneError::CollectionInProgress);
        }
        if !self.thread.begin_tlc() {
            error!(target: "autozone::tlc", thread = ?self.thread.id(), "thread-local collection already active");
            return Err(ZoneError::CollectionInProgress);
        }
        let start = Instant::now();
        let thread = self.thread;
        let _tlc = thread.tlc_lock.lock();
        let mut outcome = self.mark_and_partition();

        if !outcome.garbage.is_empty() {
            match self.mode {
                FinalizeMode::Now => self.finalize_now(&mut outcome),
                FinalizeMode::Later => self.finalize_later(&outcome.garbage),
                FinalizeMode::Suspended => self.finalize_suspended(&outcome.garbage),
            }
        }

        self.thread.end_tlc();
        let limit = self.zone.config().local_allocations_size_limit;
        if self.thread.local_count() > limit / 2 {
            self.zone.flush_locals(self.thread);
            outcome.flushed = true;
        }
        outcome.duration = start.elapsed();
        self.zone.record_local(&outcome);
        debug!(
            target: "autozone::tlc",
            mode = ?self.mode,
            marked = outcome.marked,
            garbage = outcome.garbage.len(),
            evicted = outcome.evicted,
            scavenged = outcome.scavenged,
            flushed = outcome.flushed,
            elapsed_us = outcome.duration.as_micros() as u64,
            "thread-local collection"
        );
        Ok(outcome)
    }

    /// Steps 1 through 4, plus eviction, with the locals set locked.
    fn mark_and_partition(&mut self) -> TlcOutcome {
        let mut outcome = TlcOutcome::default();
        let thread = self.thread;
        let mut locals = thread.locals();
        let _guard = thread.locals_guard.enter();
        self.worklist = std::mem::take(&mut *thread.tlc_buffer.lock());
        self.worklist.clear();
        locals.clear_all_flags();

        for range in self.zone.stacks().ranges(thread) {
            self.scan_range(&mut locals, range);
        }
        self.scan_closure(&mut locals);

        outcome.marked = locals.count_with(LocalFlags::MARKED);
        if locals.count() == outcome.marked {
            locals.clear_all_flags();
            *thread.tlc_buffer.lock() = std::mem::take(&mut self.worklist);
            return outcome;
        }

        let doomed: Vec<(usize, usize)> = locals
            .iter()
            .filter(|(_, entry)| !entry.flags.contains(LocalFlags::MARKED))
            .map(|(index, entry)| (index, entry.address))
            .collect();
        for &(index, address) in &doomed {
            locals.remove_at(index);
            outcome.garbage.push(address);
        }

        if thread.is_suspended() {
            locals.rehash();
        } else {
            locals.compact();
        }

        if self.mode != FinalizeMode::Now {
            outcome.evicted = self.evict(&mut locals, &outcome.garbage);
        }
        locals.clear_all_flags();
        *thread.tlc_buffer.lock() = std::mem::take(&mut self.worklist);
        outcome
    }

    fn scan_range(&mut self, locals: &mut PointerHash, range: WordRange) {
        let region = &self.zone.heap.region;
        let (base, size) = (region.base(), region.size());
        let mut addr = (range.start + WORD - 1) & !(WORD - 1);
        // Four words at a time; most stack words are not heap pointers.
        while addr + 4 * WORD <= range.end {
            // SAFETY: published stack ranges stay readable while published.
            let words = unsafe {
                [
                    heap::load_word(addr),
                    heap::load_word(addr + WORD),
                    heap::load_word(addr + 2 * WORD),
                    heap::load_word(addr + 3 * WORD),
                ]
            };
            if words.iter().any(|word| word.wrapping_sub(base) < size) {
                for word in words {
                    consider(self.zone, locals, &mut self.worklist, word);
                }
            }
            addr += 4 * WORD;
        }
        while addr + WORD <= range.end {
            // SAFETY: as above.
            let word = unsafe { heap::load_word(addr) };
            consider(self.zone, locals, &mut self.worklist, word);
            addr += WORD;
        }
    }

    fn scan_closure(&mut self, locals: &mut PointerHash) {
        while let Some(address) = self.worklist.pop() {
            let Some(block) = self.zone.heap.block(address) else {
                continue;
            };
            let zone = self.zone;
            let worklist = &mut self.worklist;
            zone.for_each_pointer(&block, |_, value| consider(zone, locals, worklist, value));
        }
    }

    /// Make global every surviving local referenced from garbage.
    fn evict(&self, locals: &mut PointerHash, garbage: &[usize]) -> usize {
        let mut referenced = Vec::new();
        for &address in garbage {
            let Some(block) = self.zone.heap.block(address) else {
                continue;
            };
            self.zone.for_each_pointer(&block, |_, value| {
                if locals.contains(value) {
                    referenced.push(value);
                }
            });
        }
        referenced
            .into_iter()
            .map(|value| self.zone.make_global(Some(self.thread), locals, value))
            .sum()
    }

    fn finalize_now(&self, outcome: &mut TlcOutcome) {
        let zone = self.zone;
        for block in outcome.garbage.iter().filter_map(|&g| zone.heap.block(g)) {
            block.meta().set(BlockFlags::LOCAL_DEAD);
        }
        zone.host().invalidate_garbage(&outcome.garbage);

        let _phase = zone.phase_lock.write();
        zone.forget_weak_slots(BlockFlags::LOCAL_DEAD);
        let mut cache = self.thread.cache.lock();
        let mut cached: Vec<Block<'_>> = Vec::new();
        for block in outcome.garbage.iter().filter_map(|&g| zone.heap.block(g)) {
            let Block::Quantum { subzone, index } = block else {
                continue;
            };
            let meta = subzone.meta(index);
            if meta.test(BlockFlags::ZOMBIE) {
                let _admin = zone.heap.partition.admin_at(subzone.admin()).lock();
                meta.clear_flags(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD);
                outcome.retained += 1;
            } else if meta.refcount() > 0 {
                zone.host().over_retained(block.address());
                meta.clear_flags(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD);
                outcome.retained += 1;
            } else if cache.put(subzone.admin(), meta.quanta(), block.address()) {
                cached.push(block);
            } else {
                meta.set_layout(BlockLayout::UNSCANNED);
                meta.clear_flags(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD);
                outcome.dropped += 1;
            }
        }
        drop(cache);

        let freed: Vec<usize> = cached.iter().map(Block::address).collect();
        if !freed.is_empty() {
            zone.host().free_garbage(&freed);
        }
        let scribble = zone.config().scribble_on_free;
        for block in &cached {
            let size = block.size();
            if scribble {
                heap::zero(block.address(), size);
            }
            block.meta().init_free(block.meta().quanta(), false);
            zone.account_free(size);
        }
        outcome.scavenged = cached.len();
    }

    fn finalize_later(&self, garbage: &[usize]) {
        for block in garbage.iter().filter_map(|&g| self.zone.heap.block(g)) {
            block.meta().set(BlockFlags::LOCAL_DEAD);
        }
        self.zone.enqueue(CollectionTask::FinalizeLocal {
            garbage: garbage.to_vec(),
        });
    }

    fn finalize_suspended(&self, garbage: &[usize]) {
        for block in garbage.iter().filter_map(|&g| self.zone.heap.block(g)) {
            block.meta().clear_flags(BlockFlags::THREAD_LOCAL);
        }
    }
}

/// Candidate test: mark `value` if it starts an unmarked local of this thread.
fn consider(zone: &Zone, locals: &mut PointerHash, worklist: &mut Vec<usize>, value: usize) {
    let Some(subzone) = zone.heap.region.subzone_for(value) else {
        return;
    };
    let Some(index) = subzone.block_at(value) else {
        return;
    };
    if !subzone.meta(index).test(BlockFlags::THREAD_LOCAL) {
        return;
    }
    let Some(slot) = locals.find(value) else {
        return;
    };
    if !locals.set_flags_at(slot, LocalFlags::MARKED).contains(LocalFlags::MARKED) {
        worklist.push(value);
    }
}
