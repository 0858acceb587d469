//! Per-mutator collector state

use crate::host::WordRange;
use crate::pointer_hash::PointerHash;
use crate::sync::{LockedBoolean, Mutex, MutexGuard, SentinelCounter};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Thread-local collection state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlcState {
    /// No thread-local collection running
    Idle = 0,
    /// A thread-local collection owns the locals set
    Collecting = 1,
}

/// Re-armable timer deciding when a suspended thread is checked.
#[derive(Debug)]
pub struct Watchdog {
    armed: AtomicBool,
    last_tickle: Mutex<Instant>,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
            last_tickle: Mutex::new(Instant::now()),
        }
    }

    /// Allow the watchdog to fire again
    pub fn arm(&self) {
        self.tickle();
        self.armed.store(true, Ordering::Release);
    }

    /// Stop the watchdog until re-armed
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// True if armed
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Restart the interval
    pub fn tickle(&self) {
        *self.last_tickle.lock() = Instant::now();
    }

    /// True once armed and `interval` has passed since the last tickle
    pub fn expired(&self, interval: Duration) -> bool {
        self.is_armed() && self.last_tickle.lock().elapsed() >= interval
    }
}

/// Private free-block cache fed by thread-local collections.
///
/// Entries are keyed by (admin index, quanta) and carry `FREE` metadata
/// so global walkers skip them.
#[derive(Debug)]
pub struct ThreadCache {
    entries: FxHashMap<(usize, u32), Vec<usize>>,
    limit: usize,
    blocks: usize,
}

impl ThreadCache {
    /// Cache holding at most `limit` blocks per key
    pub fn new(limit: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            limit,
            blocks: 0,
        }
    }

    /// Take a cached block
    pub fn take(&mut self, admin: usize, quanta: u32) -> Option<usize> {
        let addr = self.entries.get_mut(&(admin, quanta))?.pop()?;
        self.blocks -= 1;
        Some(addr)
    }

    /// Cache a block; false if the key is already at its limit
    pub fn put(&mut self, admin: usize, quanta: u32, addr: usize) -> bool {
        let list = self.entries.entry((admin, quanta)).or_default();
        if list.len() >= self.limit {
            return false;
        }
        list.push(addr);
        self.blocks += 1;
        true
    }

    /// Remove every cached block as (admin, address) pairs
    pub fn drain(&mut self) -> Vec<(usize, usize)> {
        self.blocks = 0;
        self.entries
            .drain()
            .flat_map(|((admin, _), list)| list.into_iter().map(move |addr| (admin, addr)))
            .collect()
    }

    /// Cached blocks
    pub fn len(&self) -> usize {
        self.blocks
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }
}

/// One registered mutator thread.
pub struct Thread {
    id: ThreadId,
    pub(crate) locals: Mutex<PointerHash>,
    pub(crate) locals_guard: SentinelCounter,
    pub(crate) in_collector: SentinelCounter,
    tlc_state: AtomicU8,
    pub(crate) tlc_lock: Mutex<()>,
    pub(crate) tlc_buffer: Mutex<Vec<usize>>,
    stack_ranges: Mutex<Vec<WordRange>>,
    pub(crate) needs_enlivening: LockedBoolean,
    pub(crate) enliven_queue: Mutex<Vec<usize>>,
    suspended: AtomicBool,
    pub(crate) watchdog: Watchdog,
    pub(crate) cache: Mutex<ThreadCache>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, cache_limit: usize) -> Self {
        Self {
            id,
            locals: Mutex::new(PointerHash::new()),
            locals_guard: SentinelCounter::new(),
            in_collector: SentinelCounter::new(),
            tlc_state: AtomicU8::new(TlcState::Idle as u8),
            tlc_lock: Mutex::new(()),
            tlc_buffer: Mutex::new(Vec::new()),
            stack_ranges: Mutex::new(Vec::new()),
            needs_enlivening: LockedBoolean::new(false),
            enliven_queue: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            watchdog: Watchdog::new(),
            cache: Mutex::new(ThreadCache::new(cache_limit)),
        }
    }

    /// OS thread identity
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Publish the ranges scanned as this thread's roots.
    ///
    /// # Safety
    /// Every range must stay readable until replaced or cleared.
    pub unsafe fn set_stack_ranges(&self, ranges: Vec<WordRange>) {
        *self.stack_ranges.lock() = ranges;
    }

    /// Stop scanning any published range
    pub fn clear_stack_ranges(&self) {
        self.stack_ranges.lock().clear();
    }

    /// Currently published ranges
    pub fn stack_ranges(&self) -> Vec<WordRange> {
        self.stack_ranges.lock().clone()
    }

    /// Thread-local collection state
    pub fn tlc_state(&self) -> TlcState {
        match self.tlc_state.load(Ordering::Acquire) {
            0 => TlcState::Idle,
            _ => TlcState::Collecting,
        }
    }

    /// Claim the locals set for a thread-local collection
    pub(crate) fn begin_tlc(&self) -> bool {
        self.tlc_state
            .compare_exchange(
                TlcState::Idle as u8,
                TlcState::Collecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn end_tlc(&self) {
        let prior = self.tlc_state.swap(TlcState::Idle as u8, Ordering::AcqRel);
        debug_assert_eq!(prior, TlcState::Collecting as u8);
    }

    /// Number of thread-local blocks
    pub fn local_count(&self) -> usize {
        self.locals.lock().count()
    }

    /// Locked locals set
    pub(crate) fn locals(&self) -> MutexGuard<'_, PointerHash> {
        self.locals.lock()
    }

    /// Promise not to touch managed memory until [`Thread::resume`].
    ///
    /// A suspended thread becomes eligible for watchdog-driven
    /// thread-local collection run by the collector thread.
    pub fn suspend(&self) {
        self.watchdog.tickle();
        self.suspended.store(true, Ordering::Release);
    }

    /// Leave the suspended state, waiting out any collection running on
    /// this thread's behalf.
    pub fn resume(&self) {
        let _tlc = self.tlc_lock.lock();
        self.suspended.store(false, Ordering::Release);
        self.watchdog.arm();
    }

    /// True while suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Blocks held in the private free cache
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("tlc_state", &self.tlc_state())
            .field("suspended", &self.is_suspended())
            .finish_non_exhaustive()
    }
}
