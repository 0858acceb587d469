//! The zone: allocation surface and collector orchestration
//!
//! A [`Zone`] owns the managed heap, the weak reference table, the set of
//! registered mutator threads and the background work queue. It is an
//! explicitly created value shared as `Arc<Zone>`; dropping the last
//! reference stops the collector thread and releases all memory.
//!
//! Blocks allocated by a registered thread start thread-local: they are
//! tracked in that thread's locals set and reclaimed by thread-local
//! collection until they escape. Everything else is global and reclaimed
//! by the background collector (see `collect.rs`).

mod barrier;
mod collect;
mod mark;
mod queue;
mod stats;

pub(crate) use queue::CollectionTask;
pub use stats::ZoneStats;

use crate::config::{Dispatch, ZoneConfig};
use crate::heap::{
    self, Block, BlockAttrs, BlockFlags, BlockLayout, Heap, SizeClass, SubzonePartition, WORD,
};
use crate::host::{CollectorHost, DefaultHost, PublishedStacks, StackEnumerator};
use crate::pointer_hash::PointerHash;
use crate::sync::{ConditionBarrier, LockedBoolean, Mutex, RwLock, UnconditionalBarrier};
use crate::thread::Thread;
use crate::tlc::{self, FinalizeMode, ThreadLocalCollector, TlcOutcome};
use crate::weak::{WeakCallback, WeakTable};
use crate::{ZoneError, ZoneResult};
use bitflags::bitflags;
use dashmap::DashMap;
use queue::TaskQueue;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::debug;

/// Phase of the global collector, observable for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionState {
    /// No global collection running
    Idle = 0,
    /// Marking; new global blocks are allocated marked
    Scanning = 1,
    /// Garbage known; weak references and host invalidation
    Finalizing = 2,
    /// Garbage being returned to the admins
    Reclaiming = 3,
}

impl CollectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CollectionState::Scanning,
            2 => CollectionState::Finalizing,
            3 => CollectionState::Reclaiming,
            _ => CollectionState::Idle,
        }
    }
}

bitflags! {
    /// Collection request options.
    ///
    /// With no mode bit set the zone's heuristics decide both the global
    /// and the thread-local part. Among mode bits the strongest wins:
    /// exhaustive, then full, then generational, then ratio.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CollectOptions: u32 {
        /// Ratio collection: generational, full every Nth time
        const RATIO = 1 << 0;
        /// Generational collection
        const GENERATIONAL = 1 << 1;
        /// Full collection
        const FULL = 1 << 2;
        /// Full collections until nothing more is freed
        const EXHAUSTIVE = 1 << 3;
        /// Thread-local collection of the calling thread, finalizing now
        const LOCAL = 1 << 4;
        /// Skip the request if one of the same mode is already pending
        const COALESCE = 1 << 5;
        /// Run the global collection on the calling thread
        const SYNCHRONOUS = 1 << 6;
    }
}

/// Global collection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalMode {
    /// Generational, with a full collection every Nth time
    Ratio,
    /// Young blocks only, old blocks through dirty cards
    Generational,
    /// Every block
    Full,
    /// Full collections while they keep freeing blocks
    Exhaustive,
}

impl GlobalMode {
    /// Every mode
    pub const ALL: [GlobalMode; 4] = [
        GlobalMode::Ratio,
        GlobalMode::Generational,
        GlobalMode::Full,
        GlobalMode::Exhaustive,
    ];

    /// Strongest mode requested by `options`
    pub fn from_options(options: CollectOptions) -> Option<Self> {
        if options.contains(CollectOptions::EXHAUSTIVE) {
            Some(GlobalMode::Exhaustive)
        } else if options.contains(CollectOptions::FULL) {
            Some(GlobalMode::Full)
        } else if options.contains(CollectOptions::GENERATIONAL) {
            Some(GlobalMode::Generational)
        } else if options.contains(CollectOptions::RATIO) {
            Some(GlobalMode::Ratio)
        } else {
            None
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// In-flight global collection requests per mode
#[derive(Debug, Default)]
struct PendingCollections {
    counts: [u8; 4],
}

/// What a call to [`Zone::collect`] did
#[derive(Debug, Default)]
pub struct CollectSummary {
    /// Thread-local collection run on the calling thread
    pub local: Option<TlcOutcome>,
    /// Global mode requested
    pub global: Option<GlobalMode>,
    /// Background work was queued for the global request
    pub enqueued: bool,
}

/// A garbage-collected allocation zone.
pub struct Zone {
    config: ZoneConfig,
    host: Arc<dyn CollectorHost>,
    stacks: Arc<dyn StackEnumerator>,
    pub(crate) heap: Heap,
    pub(crate) weak: WeakTable,
    threads: DashMap<ThreadId, Arc<Thread>>,
    roots: Mutex<FxHashSet<usize>>,
    pub(crate) zombies: Mutex<Vec<usize>>,
    state: AtomicU8,
    pending: Mutex<PendingCollections>,
    ratio_counter: AtomicU32,
    bytes_since_collection: AtomicUsize,
    bytes_in_use: AtomicUsize,
    blocks_in_use: AtomicUsize,
    /// Enlivening flag for unregistered mutators
    pub(crate) enlivening: LockedBoolean,
    pub(crate) enliven_queue: Mutex<Vec<usize>>,
    pub(crate) collection_lock: Mutex<()>,
    pub(crate) phase_lock: RwLock<()>,
    stack_logging: AtomicBool,
    pub(crate) stats: Mutex<ZoneStats>,
    queue: TaskQueue,
}

impl Zone {
    /// Create a zone with the default host and published stack ranges
    pub fn new(config: ZoneConfig) -> ZoneResult<Arc<Self>> {
        Self::with_host(config, Arc::new(DefaultHost), Arc::new(PublishedStacks))
    }

    /// Create a zone with embedder hooks
    pub fn with_host(
        config: ZoneConfig,
        host: Arc<dyn CollectorHost>,
        stacks: Arc<dyn StackEnumerator>,
    ) -> ZoneResult<Arc<Self>> {
        let heap = Heap::new(config.region_size)?;
        let zone = Arc::new(Self {
            host,
            stacks,
            heap,
            weak: WeakTable::new(),
            threads: DashMap::new(),
            roots: Mutex::new(FxHashSet::default()),
            zombies: Mutex::new(Vec::new()),
            state: AtomicU8::new(CollectionState::Idle as u8),
            pending: Mutex::new(PendingCollections::default()),
            ratio_counter: AtomicU32::new(0),
            bytes_since_collection: AtomicUsize::new(0),
            bytes_in_use: AtomicUsize::new(0),
            blocks_in_use: AtomicUsize::new(0),
            enlivening: LockedBoolean::new(false),
            enliven_queue: Mutex::new(Vec::new()),
            collection_lock: Mutex::new(()),
            phase_lock: RwLock::new(()),
            stack_logging: AtomicBool::new(false),
            stats: Mutex::new(ZoneStats::default()),
            queue: TaskQueue::new(),
            config,
        });
        if zone.config.dispatch == Dispatch::Background {
            let interval = Duration::from_millis(zone.config.watchdog_interval_ms.max(1));
            zone.queue.start(Arc::downgrade(&zone), interval)?;
        }
        debug!(
            target: "autozone::gc",
            region = zone.heap.region.size(),
            dispatch = ?zone.config.dispatch,
            "zone created"
        );
        Ok(zone)
    }

    /// Configuration
    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub(crate) fn host(&self) -> &dyn CollectorHost {
        &*self.host
    }

    pub(crate) fn stacks(&self) -> &dyn StackEnumerator {
        &*self.stacks
    }

    /// Current collector phase
    pub fn state(&self) -> CollectionState {
        CollectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CollectionState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(target: "autozone::gc", ?state, "collector phase");
    }

    /// Snapshot of the statistics
    pub fn statistics(&self) -> ZoneStats {
        self.stats.lock().clone()
    }

    /// Bytes in allocated blocks
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// Allocated blocks
    pub fn blocks_in_use(&self) -> usize {
        self.blocks_in_use.load(Ordering::Relaxed)
    }

    /// Bytes allocated since the last global collection
    pub fn bytes_since_collection(&self) -> usize {
        self.bytes_since_collection.load(Ordering::Relaxed)
    }

    /// Requests of `mode` queued or running
    pub fn pending_collections(&self, mode: GlobalMode) -> u8 {
        self.pending.lock().counts[mode.index()]
    }

    /// Tasks waiting in the background queue
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Bytes of address space reserved for subzones
    pub fn region_size(&self) -> usize {
        self.heap.region.size()
    }

    /// Weak reference table
    pub fn weak_table(&self) -> &WeakTable {
        &self.weak
    }

    // ===== Threads =====

    /// Register the calling thread as a mutator.
    pub fn register_thread(&self) -> ZoneResult<Arc<Thread>> {
        let id = std::thread::current().id();
        let thread = Arc::new(Thread::new(id, self.config.thread_cache_limit));
        // Holding the zone flag keeps a collection from enabling enlivening
        // between the copy below and the insertion.
        let zone_flag = UnconditionalBarrier::new(&self.enlivening);
        match self.threads.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ZoneError::AlreadyRegistered),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                UnconditionalBarrier::new(&thread.needs_enlivening).set(zone_flag.get());
                slot.insert(thread.clone());
                debug!(target: "autozone::gc", thread = ?id, "thread registered");
                Ok(thread)
            }
        }
    }

    /// Unregister the calling thread, making its locals global and
    /// returning its cached blocks to the admins.
    pub fn unregister_thread(&self) -> ZoneResult<()> {
        let id = std::thread::current().id();
        let thread = self.current_thread().ok_or(ZoneError::NotRegistered)?;
        // Flush while still registered so a running collection drains
        // whatever the flush enlivens.
        self.retire_thread(&thread);
        {
            let _zone_flag = UnconditionalBarrier::new(&self.enlivening);
            self.threads.remove(&id);
            let leftover = std::mem::take(&mut *thread.enliven_queue.lock());
            self.enliven_queue.lock().extend(leftover);
        }
        debug!(target: "autozone::gc", thread = ?id, "thread unregistered");
        Ok(())
    }

    fn retire_thread(&self, thread: &Thread) {
        let _tlc = thread.tlc_lock.lock();
        self.flush_locals(thread);
        let cached = thread.cache.lock().drain();
        for (admin, addr) in cached {
            self.heap
                .partition
                .admin_at(admin)
                .free(&self.heap.region, addr, false);
        }
        thread.clear_stack_ranges();
    }

    /// The calling thread's registration
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.threads
            .get(&std::thread::current().id())
            .map(|entry| entry.value().clone())
    }

    /// Every registered thread
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of registered threads
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Malloc stack logging uses an auxiliary allocator that suspended-thread
    /// collection could deadlock against; while set, the watchdog never fires.
    pub fn set_stack_logging(&self, enabled: bool) {
        self.stack_logging.store(enabled, Ordering::Release);
    }

    /// True while stack logging is active
    pub fn is_stack_logging(&self) -> bool {
        self.stack_logging.load(Ordering::Acquire)
    }

    // ===== Allocation =====

    /// Allocate a block of at least `size` bytes.
    ///
    /// `clear` zeroes the block; `retained` starts it with a retain count
    /// of one. Blocks allocated by a registered thread start thread-local.
    pub fn allocate(
        &self,
        size: usize,
        layout: BlockLayout,
        clear: bool,
        retained: bool,
    ) -> ZoneResult<usize> {
        self.allocate_block(size, layout, clear, retained, true)
    }

    fn allocate_block(
        &self,
        size: usize,
        layout: BlockLayout,
        clear: bool,
        retained: bool,
        may_collect: bool,
    ) -> ZoneResult<usize> {
        if size > isize::MAX as usize {
            return Err(ZoneError::InvalidSize);
        }
        let size = size.max(1);
        let thread = self.current_thread();
        let local = self.config.thread_local_collection
            && thread.is_some()
            && !Heap::is_large_size(size);

        if let Some(thread) = thread.as_deref().filter(|_| local && may_collect) {
            if tlc::should_collect(self, thread, false) {
                if let Err(err) = self.collect_local_on(thread, FinalizeMode::Later) {
                    debug!(target: "autozone::tlc", thread = ?thread.id(), %err, "deferred local collection refused");
                }
            }
        }

        let attrs = BlockAttrs {
            layout,
            thread_local: local,
            refcount_one: retained,
        };
        let (addr, bytes) = if Heap::is_large_size(size) {
            let addr = self
                .heap
                .large
                .allocate(size, attrs, || self.allocates_black())?;
            let bytes = self.heap.large.get(addr).map_or(size, |block| block.size());
            (addr, bytes)
        } else {
            let class = SizeClass::for_size(size);
            let quanta = class.quanta_for(size);
            let index = SubzonePartition::admin_index(size, layout, retained);
            let cached = match thread.as_deref().filter(|_| local) {
                Some(thread) => thread.cache.lock().take(index, quanta),
                None => None,
            };
            let addr = match cached {
                Some(addr) => {
                    let subzone = self
                        .heap
                        .region
                        .subzone_for(addr)
                        .ok_or(ZoneError::Exhausted { size })?;
                    subzone
                        .meta(subzone.quantum_index(addr))
                        .init_block(quanta, attrs, false);
                    addr
                }
                None => self
                    .heap
                    .partition
                    .admin_at(index)
                    .allocate(&self.heap.region, quanta, attrs, || {
                        !local && self.allocates_black()
                    })
                    .ok_or(ZoneError::Exhausted { size })?,
            };
            (addr, (quanta as usize) << class.quantum_shift())
        };

        if clear && !self.config.scribble_on_free {
            heap::zero(addr, bytes);
        }
        self.account_allocation(bytes);
        if let Some(thread) = thread.as_deref().filter(|_| local) {
            thread.locals().add(addr);
        }
        if may_collect && self.should_collect() {
            self.request_global(GlobalMode::Ratio, true);
        }
        Ok(addr)
    }

    /// Global blocks allocated while the collector scans are born marked.
    fn allocates_black(&self) -> bool {
        self.state() == CollectionState::Scanning
    }

    /// Explicitly free a block.
    ///
    /// Blocks the collector has already condemned are left to it.
    pub fn deallocate(&self, addr: usize) -> ZoneResult<()> {
        let block = self.heap.block(addr).ok_or(ZoneError::NotABlock(addr))?;
        let phase = self.phase_lock.read();
        let flags = block.flags();
        if flags.intersects(BlockFlags::GARBAGE | BlockFlags::LOCAL_DEAD) {
            return Ok(());
        }
        if flags.contains(BlockFlags::THREAD_LOCAL) {
            for thread in self.threads() {
                if thread.locals().remove(addr) {
                    break;
                }
            }
        }
        let (start, end) = (addr, addr + block.size());
        let mut callbacks = None;
        if !self.weak.is_empty() {
            self.weak.forget_slots(|slot| slot >= start && slot < end);
            // SAFETY: registered slots stay valid while registered.
            let cleared = unsafe { self.weak.clear_references(&[addr], |_| None) };
            if cleared.cleared > 0 {
                self.stats.lock().weak_cleared += cleared.cleared;
            }
            callbacks = cleared.callbacks;
        }
        let size = block.size();
        self.heap.free(block, self.config.scribble_on_free);
        self.account_free(size);
        drop(phase);

        // Callbacks may allocate or register again.
        WeakTable::call_callbacks(callbacks);
        Ok(())
    }

    /// Move a block to a new block of `size` bytes, copying its contents.
    ///
    /// A zero address allocates a fresh scanned block.
    pub fn reallocate(&self, addr: usize, size: usize) -> ZoneResult<usize> {
        if addr == 0 {
            return self.allocate(size, BlockLayout::SCANNED, true, false);
        }
        let block = self.heap.block(addr).ok_or(ZoneError::NotABlock(addr))?;
        let layout = block.layout();
        let refcount = block.meta().refcount();
        let fresh = self.allocate_block(size, layout, true, refcount > 0, false)?;
        for _ in 1..refcount {
            if let Some(target) = self.heap.block(fresh) {
                target.meta().retain();
            }
        }
        let copied = block.size().min(size.max(1));
        let mut offset = 0;
        while offset + WORD <= copied {
            let word = block.word(offset);
            // SAFETY: both blocks are allocated and `offset` is in bounds.
            unsafe {
                if layout.is_scanned() {
                    self.write_barrier(fresh + offset, word);
                } else {
                    heap::store_word(fresh + offset, word);
                }
            }
            offset += WORD;
        }
        self.deallocate(addr)?;
        Ok(fresh)
    }

    // ===== Block queries =====

    /// Usable size of the block starting at `addr`
    pub fn size(&self, addr: usize) -> Option<usize> {
        self.heap.block(addr).map(|block| block.size())
    }

    /// Layout of the block starting at `addr`
    pub fn block_layout(&self, addr: usize) -> Option<BlockLayout> {
        self.heap.block(addr).map(|block| block.layout())
    }

    /// Collector flags of the block starting at `addr`
    pub fn block_flags(&self, addr: usize) -> Option<BlockFlags> {
        self.heap.block(addr).map(|block| block.flags())
    }

    /// Start of the block containing `addr`
    pub fn block_start(&self, addr: usize) -> Option<usize> {
        self.heap.block_containing(addr).map(|block| block.address())
    }

    /// True if `addr` lies in memory managed by this zone
    pub fn is_managed(&self, addr: usize) -> bool {
        self.heap.contains(addr)
    }

    /// True if the block starting at `addr` is still thread-local
    pub fn is_thread_local(&self, addr: usize) -> bool {
        self.heap.block(addr).is_some_and(|block| {
            block.flags().contains(BlockFlags::THREAD_LOCAL)
                && !block.flags().contains(BlockFlags::LOCAL_DEAD)
        })
    }

    // ===== Retain / release =====

    /// Add a retain; retained blocks are roots. A thread-local block of the
    /// calling thread escapes first.
    pub fn retain(&self, addr: usize) -> ZoneResult<u32> {
        let block = self.heap.block(addr).ok_or(ZoneError::NotABlock(addr))?;
        self.escape_value(self.current_thread().as_deref(), addr);
        Ok(block.meta().retain())
    }

    /// Drop a retain
    pub fn release(&self, addr: usize) -> ZoneResult<u32> {
        let block = self.heap.block(addr).ok_or(ZoneError::NotABlock(addr))?;
        Ok(block.meta().release())
    }

    /// Current retain count
    pub fn retain_count(&self, addr: usize) -> ZoneResult<u32> {
        let block = self.heap.block(addr).ok_or(ZoneError::NotABlock(addr))?;
        Ok(block.meta().refcount())
    }

    // ===== Roots =====

    /// Scan `slot` as a root of every global collection.
    ///
    /// # Safety
    /// `slot` must be a readable, word-aligned cell until removed.
    pub unsafe fn add_root(&self, slot: usize) {
        self.roots.lock().insert(slot);
        let value = heap::load_word(slot);
        self.escape_value(self.current_thread().as_deref(), value);
    }

    /// Stop scanning `slot`
    pub fn remove_root(&self, slot: usize) -> bool {
        self.roots.lock().remove(&slot)
    }

    /// Registered root slots
    pub fn roots(&self) -> Vec<usize> {
        self.roots.lock().iter().copied().collect()
    }

    // ===== Weak references =====

    /// Register `slot` as a weak reference to `referent`, storing
    /// `referent` into it. A thread-local referent escapes first.
    ///
    /// # Safety
    /// `slot` must be a word-aligned cell that stays valid until it is
    /// unregistered, re-registered, or cleared by a collection.
    pub unsafe fn weak_register(
        &self,
        referent: usize,
        slot: usize,
        callback: Option<Arc<WeakCallback>>,
    ) {
        if referent != 0 {
            self.escape_value(self.current_thread().as_deref(), referent);
        }
        self.weak.register(referent, slot, callback);
    }

    /// Drop the registration of `slot` against `referent`.
    ///
    /// # Safety
    /// Same contract as [`Zone::weak_register`].
    pub unsafe fn weak_unregister(&self, referent: usize, slot: usize) {
        self.weak.unregister(referent, slot);
    }

    /// Read a weak slot. Returns 0 once the referent is condemned; while a
    /// collection scans, a referent read here is kept alive.
    ///
    /// # Safety
    /// `slot` must be a registered weak slot.
    pub unsafe fn weak_read(&self, slot: usize) -> usize {
        let thread = self.current_thread();
        let flag = self.enlivening_flag(thread.as_deref());
        let barrier = ConditionBarrier::new(flag);
        let value = heap::load_word(slot);
        if value == 0 {
            return 0;
        }
        let Some(block) = self.heap.block(value) else {
            return value;
        };
        if block.flags().contains(BlockFlags::GARBAGE) {
            return 0;
        }
        if barrier.is_set() {
            self.enliven_locked(thread.as_deref(), value);
        }
        value
    }

    // ===== Escape =====

    /// Escape `value` if it is a live local of `thread`
    pub(crate) fn escape_value(&self, thread: Option<&Thread>, value: usize) -> usize {
        let Some(thread) = thread else {
            return 0;
        };
        if !self.is_thread_local(value) {
            return 0;
        }
        let mut locals = thread.locals();
        self.make_global(Some(thread), &mut locals, value)
    }

    /// Make `addr` and every local reachable from it global.
    pub(crate) fn make_global(
        &self,
        thread: Option<&Thread>,
        locals: &mut PointerHash,
        addr: usize,
    ) -> usize {
        let barrier = ConditionBarrier::new(self.enlivening_flag(thread));
        self.make_global_locked(thread, locals, addr, barrier.is_set())
    }

    /// Escape closure with the enlivening barrier already held.
    pub(crate) fn make_global_locked(
        &self,
        thread: Option<&Thread>,
        locals: &mut PointerHash,
        addr: usize,
        enliven: bool,
    ) -> usize {
        let mut escaped = 0;
        let mut pending = vec![addr];
        while let Some(addr) = pending.pop() {
            let Some(block) = self.heap.block(addr) else {
                continue;
            };
            let flags = block.flags();
            if !flags.contains(BlockFlags::THREAD_LOCAL) || flags.contains(BlockFlags::LOCAL_DEAD) {
                continue;
            }
            if !locals.remove(addr) {
                continue;
            }
            block.meta().clear_flags(BlockFlags::THREAD_LOCAL);
            if enliven {
                self.enliven_locked(thread, addr);
            }
            escaped += 1;
            self.for_each_pointer(&block, |_, value| {
                if locals.contains(value) {
                    pending.push(value);
                }
            });
        }
        escaped
    }

    /// Make every local of `thread` global.
    pub(crate) fn flush_locals(&self, thread: &Thread) -> usize {
        let mut locals = thread.locals();
        let barrier = ConditionBarrier::new(&thread.needs_enlivening);
        let mut flushed = 0;
        for addr in locals.addresses() {
            let Some(block) = self.heap.block(addr) else {
                continue;
            };
            if block.flags().contains(BlockFlags::LOCAL_DEAD) {
                continue;
            }
            if block.meta().test_and_clear(BlockFlags::THREAD_LOCAL) {
                if barrier.is_set() {
                    self.enliven_locked(Some(thread), addr);
                }
                flushed += 1;
            }
        }
        locals.clear();
        debug!(target: "autozone::tlc", thread = ?thread.id(), flushed, "locals flushed");
        flushed
    }

    pub(crate) fn enlivening_flag<'a>(&'a self, thread: Option<&'a Thread>) -> &'a LockedBoolean {
        thread.map_or(&self.enlivening, |thread| &thread.needs_enlivening)
    }

    /// Mark `value` and queue it for the marker. The enlivening barrier of
    /// `thread` (or of the zone) must be held and set.
    pub(crate) fn enliven_locked(&self, thread: Option<&Thread>, value: usize) {
        let Some(block) = self.heap.block(value) else {
            return;
        };
        if block.flags().contains(BlockFlags::THREAD_LOCAL) {
            return;
        }
        if !block.meta().test_and_set(BlockFlags::MARKED) {
            match thread {
                Some(thread) => thread.enliven_queue.lock().push(value),
                None => self.enliven_queue.lock().push(value),
            }
        }
    }

    // ===== Scanning helpers =====

    /// Visit `(slot, value)` for every pointer word of a scanned block.
    pub(crate) fn for_each_pointer(&self, block: &Block<'_>, mut f: impl FnMut(usize, usize)) {
        let layout = block.layout();
        if !layout.is_scanned() {
            return;
        }
        let base = block.address();
        let size = block.size();
        match self.host.pointer_map(base, layout) {
            Some(offsets) => {
                for &offset in offsets.iter() {
                    if offset % WORD == 0 && offset + WORD <= size {
                        f(base + offset, block.word(offset));
                    }
                }
            }
            None => {
                let mut offset = 0;
                while offset + WORD <= size {
                    f(base + offset, block.word(offset));
                    offset += WORD;
                }
            }
        }
    }

    // ===== Accounting =====

    fn account_allocation(&self, bytes: usize) {
        self.bytes_since_collection.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_in_use.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_in_use.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_free(&self, bytes: usize) {
        let _ = self
            .bytes_in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));
        let _ = self
            .blocks_in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub(crate) fn reset_allocation_counter(&self) {
        self.bytes_since_collection.store(0, Ordering::Relaxed);
    }

    // ===== Thread-local collection =====

    /// Run a thread-local collection of the calling thread, finalizing now
    pub fn collect_local(&self) -> ZoneResult<TlcOutcome> {
        let thread = self.current_thread().ok_or(ZoneError::NotRegistered)?;
        self.collect_local_on(&thread, FinalizeMode::Now)
    }

    /// Run a thread-local collection of the calling thread with an explicit
    /// finalization strategy
    pub fn collect_local_with(&self, mode: FinalizeMode) -> ZoneResult<TlcOutcome> {
        let thread = self.current_thread().ok_or(ZoneError::NotRegistered)?;
        self.collect_local_on(&thread, mode)
    }

    pub(crate) fn collect_local_on(
        &self,
        thread: &Thread,
        mode: FinalizeMode,
    ) -> ZoneResult<TlcOutcome> {
        ThreadLocalCollector::new(self, thread, mode).collect()
    }

    pub(crate) fn record_local(&self, outcome: &TlcOutcome) {
        self.stats.lock().update_local(
            outcome.garbage.len(),
            outcome.scavenged,
            outcome.duration,
        );
    }

    // ===== Background work =====

    pub(crate) fn enqueue(&self, task: CollectionTask) {
        self.queue.enqueue(task);
    }

    /// Run every queued task on the calling thread, returning how many ran.
    pub fn drain_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.try_next() {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    pub(crate) fn run_task(&self, task: CollectionTask) {
        match task {
            CollectionTask::Global(mode) => self.run_pending(mode),
            CollectionTask::FinalizeLocal { garbage } => self.finalize_local(garbage),
            CollectionTask::Shutdown => {}
        }
    }

    /// True while a background worker thread is running
    pub fn has_worker(&self) -> bool {
        self.queue.is_running()
    }

    /// Stop the background worker. Queued tasks stay queued.
    pub fn shutdown(&self) {
        self.queue.stop();
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("state", &self.state())
            .field("threads", &self.threads.len())
            .field("blocks_in_use", &self.blocks_in_use())
            .field("bytes_in_use", &self.bytes_in_use())
            .finish_non_exhaustive()
    }
}
