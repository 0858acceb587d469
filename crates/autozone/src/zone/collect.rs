//! Global collection: requests, mode selection and the pipeline
//!
//! One pass, under the collection lock:
//!
//! 1. Release last cycle's zombies
//! 2. Turn enlivening on and enter the scanning phase
//! 3. Mark roots, then drain enlivened blocks for a few rounds
//! 4. Final window: hold every enlivening flag, drain, rescan stacks, sweep
//! 5. Finalizing: clear weak references, invalidate garbage
//! 6. Reclaiming: free garbage except resurrected zombies
//! 7. Invoke weak callbacks, back to idle

use super::mark::Marker;
use super::stats::PassReport;
use super::{CollectOptions, CollectSummary, CollectionState, GlobalMode, Zone};
use crate::defaults::{ENLIVENING_DRAIN_ROUNDS, MAX_PENDING_COLLECTIONS};
use crate::heap::{Block, BlockFlags, SubzonePartition};
use crate::sync::UnconditionalBarrier;
use crate::tlc::{self, FinalizeMode};
use crate::weak::{WeakCallback, WeakTable};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

impl Zone {
    /// Request a collection.
    ///
    /// With no mode in `options` the zone's allocation heuristic decides
    /// on a ratio collection and the thread-local heuristic on a local
    /// one; both may fire. A local collection runs on the calling thread
    /// and finalizes immediately. A global one is queued unless
    /// `SYNCHRONOUS` is given.
    pub fn collect(&self, options: CollectOptions) -> CollectSummary {
        let mut summary = CollectSummary::default();
        let thread = self.current_thread();
        let explicit = GlobalMode::from_options(options);
        let run_local = if explicit.is_some() || options.contains(CollectOptions::LOCAL) {
            options.contains(CollectOptions::LOCAL)
        } else {
            thread
                .as_deref()
                .is_some_and(|thread| tlc::should_collect(self, thread, true))
        };
        let global = if explicit.is_some() || options.contains(CollectOptions::LOCAL) {
            explicit
        } else {
            self.should_collect().then_some(GlobalMode::Ratio)
        };

        if run_local {
            if let Some(thread) = thread.as_deref() {
                summary.local = match self.collect_local_on(thread, FinalizeMode::Now) {
                    Ok(outcome) => Some(outcome),
                    Err(err) => {
                        debug!(target: "autozone::tlc", thread = ?thread.id(), %err, "local collection refused");
                        None
                    }
                };
            }
        }
        if let Some(mode) = global {
            summary.global = Some(mode);
            if options.contains(CollectOptions::SYNCHRONOUS) {
                self.run_global(mode);
            } else {
                summary.enqueued =
                    self.request_global(mode, options.contains(CollectOptions::COALESCE));
            }
        }
        summary
    }

    /// Allocation heuristic: enough bytes since the last global collection
    pub fn should_collect(&self) -> bool {
        self.bytes_since_collection() >= self.config().collection_threshold
    }

    /// Count a request of `mode`, queueing work when none was pending.
    pub(crate) fn request_global(&self, mode: GlobalMode, coalesce: bool) -> bool {
        let mut pending = self.pending.lock();
        let count = &mut pending.counts[mode.index()];
        if coalesce && *count > 0 {
            return false;
        }
        if *count >= MAX_PENDING_COLLECTIONS {
            error!(target: "autozone::gc", ?mode, "pending collection counter overflow; request dropped");
            return false;
        }
        *count += 1;
        let first = *count == 1;
        drop(pending);
        if first {
            self.enqueue(super::CollectionTask::Global(mode));
        }
        first
    }

    /// Worker side of a request: run until no request of `mode` is left.
    pub(crate) fn run_pending(&self, mode: GlobalMode) {
        loop {
            self.run_global(mode);
            let mut pending = self.pending.lock();
            let count = &mut pending.counts[mode.index()];
            *count = count.saturating_sub(1);
            if *count == 0 {
                return;
            }
        }
    }

    /// Run one collection of `mode` on the calling thread.
    pub(crate) fn run_global(&self, mode: GlobalMode) {
        let config = self.config();
        match mode {
            GlobalMode::Ratio => {
                let count = self.ratio_counter.fetch_add(1, Ordering::Relaxed) + 1;
                let frequency = config.full_vs_gen_frequency.max(1);
                let full = !config.generational || count % frequency == 0;
                self.collect_pass(!full, mode);
            }
            GlobalMode::Generational => self.collect_pass(config.generational, mode),
            GlobalMode::Full => self.collect_pass(false, mode),
            GlobalMode::Exhaustive => {
                let limit = config.exhaustive_collection_limit.max(1);
                let mut live = self.blocks_in_use();
                for round in 1..=limit {
                    self.collect_pass(false, mode);
                    let now = self.blocks_in_use();
                    if now >= live {
                        debug!(target: "autozone::gc", round, live = now, "exhaustive collection settled");
                        break;
                    }
                    live = now;
                }
                let purged = {
                    let _collection = self.collection_lock.lock();
                    let mut partition = self.heap.partition.lock();
                    SubzonePartition::purge_free_space_no_lock(&mut partition, &self.heap.region)
                };
                debug!(target: "autozone::gc", purged, "free space purged");
            }
        }
    }

    /// One global mark, sweep, finalize and reclaim pass.
    fn collect_pass(&self, generational: bool, mode: GlobalMode) {
        let _collection = self.collection_lock.lock();
        let start = Instant::now();
        let caller = self.current_thread();
        let _in_collector = caller.as_deref().map(|thread| thread.in_collector.enter());

        self.release_zombies();
        if !generational {
            self.heap.clear_cards();
        }
        let threads = self.threads();
        self.set_enlivening(true);
        self.set_state(CollectionState::Scanning);

        let mut marker = Marker::new(self, generational);
        marker.mark_roots(&threads);
        marker.trace();
        for _ in 0..ENLIVENING_DRAIN_ROUNDS {
            if marker.take_enlivened(&threads) == 0 {
                break;
            }
            marker.trace();
        }

        // Final window: no mutator can store or escape until the flags
        // drop. Locals are not locked here.
        let threads = self.threads();
        let barriers: Vec<UnconditionalBarrier<'_>> = threads
            .iter()
            .map(|thread| UnconditionalBarrier::new(&thread.needs_enlivening))
            .collect();
        let zone_barrier = UnconditionalBarrier::new(&self.enlivening);
        marker.take_enlivened(&threads);
        marker.scan_stacks(&threads);
        marker.trace();

        let mut report = PassReport {
            marked: marker.marked(),
            ..PassReport::default()
        };
        let garbage = self.sweep(generational);

        for barrier in &barriers {
            barrier.set(false);
        }
        zone_barrier.set(false);
        drop(zone_barrier);
        drop(barriers);

        let callbacks = self.finalize(&garbage, &mut report);
        self.reclaim(&garbage, &mut report);
        let invoked = WeakTable::call_callbacks(callbacks);

        self.reset_allocation_counter();
        self.set_state(CollectionState::Idle);
        report.pause = start.elapsed();
        report.live_objects = self.blocks_in_use();
        report.live_bytes = self.bytes_in_use();
        self.stats.lock().update(mode, report);
        info!(
            target: "autozone::gc",
            ?mode,
            generational,
            marked = report.marked,
            freed = report.freed,
            freed_bytes = report.freed_bytes,
            weak_cleared = report.weak_cleared,
            callbacks = invoked,
            elapsed_us = report.pause.as_micros() as u64,
            "collection complete"
        );
    }

    fn set_enlivening(&self, enabled: bool) {
        let zone_barrier = UnconditionalBarrier::new(&self.enlivening);
        zone_barrier.set(enabled);
        for thread in self.threads() {
            UnconditionalBarrier::new(&thread.needs_enlivening).set(enabled);
        }
    }

    /// Zombies from the previous cycle go back to being ordinary blocks.
    fn release_zombies(&self) {
        let mut zombies = self.zombies.lock();
        zombies.retain(|&addr| {
            let Some(block) = self.heap.block(addr) else {
                return false;
            };
            let meta = block.meta();
            // Still waiting on a deferred local finalization.
            if meta.test(BlockFlags::LOCAL_DEAD) {
                return true;
            }
            meta.clear_flags(BlockFlags::ZOMBIE);
            meta.release();
            false
        });
    }

    /// Condemn every unmarked global block. Runs with all admins and the
    /// large store locked; sets the finalizing phase before unlocking.
    fn sweep(&self, generational: bool) -> Vec<usize> {
        let _partition = self.heap.partition.lock();
        let large = self.heap.large.write();
        let mut garbage = Vec::new();

        let mut visit = |block: Block<'_>| {
            let meta = block.meta();
            let flags = meta.flags();
            if flags.intersects(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD) {
                meta.clear_flags(BlockFlags::MARKED);
                return;
            }
            let survives = flags.contains(BlockFlags::MARKED)
                || (generational && meta.age() == 0)
                || meta.refcount() > 0;
            if survives {
                meta.clear_flags(BlockFlags::MARKED);
                if meta.mature() {
                    block.dirty_all();
                }
            } else {
                meta.set(BlockFlags::GARBAGE);
                garbage.push(block.address());
            }
        };
        for subzone in self.heap.region.subzones() {
            subzone.for_each_block(|index, _| visit(Block::Quantum { subzone, index }));
        }
        for block in large.values() {
            visit(Block::Large(block.clone()));
        }

        self.set_state(CollectionState::Finalizing);
        drop(large);
        debug!(target: "autozone::gc", garbage = garbage.len(), "sweep complete");
        garbage
    }

    /// Null weak references to the garbage and let the host invalidate it.
    fn finalize(&self, garbage: &[usize], report: &mut PassReport) -> Option<Arc<WeakCallback>> {
        if garbage.is_empty() {
            return None;
        }
        let mut callbacks = None;
        if !self.weak.is_empty() {
            self.forget_weak_slots(BlockFlags::GARBAGE);
            let heap = &self.heap;
            // SAFETY: slots inside condemned blocks were just forgotten;
            // every other registered slot is valid by contract.
            let cleared = unsafe {
                self.weak.clear_references(garbage, |slot| {
                    heap.block_containing(slot)
                        .map(|block| (block.address(), block.layout()))
                })
            };
            report.weak_cleared = cleared.cleared;
            callbacks = cleared.callbacks;
        }
        self.host().invalidate_garbage(garbage);
        callbacks
    }

    /// Return the pages under free blocks to the system, returning bytes
    /// purged. Purged memory reads as zero when reused.
    pub fn purge_free_space(&self) -> usize {
        let purged = self.heap.partition.purge_free_space(&self.heap.region);
        debug!(target: "autozone::gc", purged, "free space purged");
        purged
    }

    /// Drop weak registrations whose slot lies in a block carrying `flag`.
    pub(crate) fn forget_weak_slots(&self, flag: BlockFlags) -> usize {
        if self.weak.is_empty() {
            return 0;
        }
        let heap = &self.heap;
        self.weak.forget_slots(|slot| {
            heap.block_containing(slot)
                .is_some_and(|block| block.flags().contains(flag))
        })
    }

    /// Free condemned blocks, sparing zombies.
    fn reclaim(&self, garbage: &[usize], report: &mut PassReport) {
        let _phase = self.phase_lock.write();
        self.set_state(CollectionState::Reclaiming);

        let mut freed = Vec::with_capacity(garbage.len());
        for &addr in garbage {
            let Some(block) = self.heap.block(addr) else {
                continue;
            };
            if block.meta().test(BlockFlags::ZOMBIE) {
                block.meta().clear_flags(BlockFlags::GARBAGE);
                continue;
            }
            freed.push(block);
        }
        if freed.is_empty() {
            return;
        }
        let addresses: Vec<usize> = freed.iter().map(Block::address).collect();
        self.host().free_garbage(&addresses);

        let scribble = self.config().scribble_on_free;
        let mut partition = self.heap.partition.lock();
        let mut large = self.heap.large.write();
        for block in freed {
            let size = block.size();
            match block {
                Block::Quantum { subzone, index } => {
                    let addr = subzone.quantum_address(index);
                    partition
                        .state(subzone.admin())
                        .free(&self.heap.region, addr, scribble);
                }
                Block::Large(block) => {
                    block.meta().clear_flags(BlockFlags::START);
                    self.heap.large.remove_locked(&mut large, block.address());
                }
            }
            report.freed += 1;
            report.freed_bytes += size;
            self.account_free(size);
        }
    }

    /// Background finalization of garbage from a deferred thread-local
    /// collection.
    pub(crate) fn finalize_local(&self, garbage: Vec<usize>) {
        let _collection = self.collection_lock.lock();
        self.host().invalidate_garbage(&garbage);
        let _phase = self.phase_lock.write();
        self.forget_weak_slots(BlockFlags::LOCAL_DEAD);

        let mut freed = Vec::with_capacity(garbage.len());
        for &addr in &garbage {
            let Some(block) = self.heap.block(addr) else {
                continue;
            };
            let meta = block.meta();
            if !meta.test(BlockFlags::LOCAL_DEAD) {
                continue;
            }
            if meta.test(BlockFlags::ZOMBIE) {
                meta.clear_flags(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD);
            } else if meta.refcount() > 0 {
                self.host().over_retained(addr);
                meta.clear_flags(BlockFlags::THREAD_LOCAL | BlockFlags::LOCAL_DEAD);
            } else {
                freed.push(block);
            }
        }
        let addresses: Vec<usize> = freed.iter().map(Block::address).collect();
        if !addresses.is_empty() {
            self.host().free_garbage(&addresses);
        }
        let scribble = self.config().scribble_on_free;
        for block in freed {
            let size = block.size();
            self.heap.free(block, scribble);
            self.account_free(size);
        }
        debug!(
            target: "autozone::tlc",
            garbage = garbage.len(),
            freed = addresses.len(),
            "deferred local garbage finalized"
        );
    }

    /// Watchdog: collect suspended threads whose timer has expired.
    /// Returns the number of collections run.
    pub fn poll_suspended_threads(&self) -> usize {
        let interval = std::time::Duration::from_millis(self.config().watchdog_interval_ms);
        let mut collected = 0;
        for thread in self.threads() {
            if !thread.is_suspended() || !thread.watchdog.expired(interval) {
                continue;
            }
            if tlc::should_collect_suspended(self, &thread)
                && self
                    .collect_local_on(&thread, FinalizeMode::Suspended)
                    .is_ok()
            {
                collected += 1;
            }
        }
        collected
    }
}
