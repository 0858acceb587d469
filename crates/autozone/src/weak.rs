//! Weak reference table
//!
//! Maps each weakly referenced block (the referent) to the set of slots
//! that refer to it. When the global collector finds a referent to be
//! garbage, every registered slot is nulled and any attached callbacks are
//! chained for invocation once the collection has finished reclaiming.
//!
//! One spin lock serializes every operation on the table. Slots are raw
//! addresses of word-sized cells; callers promise they stay valid for as
//! long as they are registered.

use crate::defaults::{REFERRERS_DOUBLING_THRESHOLD, WEAK_TABLE_MIN_SIZE};
use crate::heap::BlockLayout;
use crate::probe::{ProbeEntry, ProbeTable};
use crate::sync::{Mutex, SpinLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Callback attached to a weak registration, invoked after its referent is
/// collected.
///
/// The same callback may be attached to several registrations; it is
/// invoked once per collection that clears any of them.
pub struct WeakCallback {
    func: Box<dyn Fn() + Send + Sync>,
    next: Mutex<Option<Arc<WeakCallback>>>,
    chained: AtomicBool,
}

impl WeakCallback {
    /// Wrap `func`
    pub fn new(func: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            func: Box::new(func),
            next: Mutex::new(None),
            chained: AtomicBool::new(false),
        })
    }

    /// True while queued on a pending invocation chain
    pub fn is_chained(&self) -> bool {
        self.chained.load(Ordering::Acquire)
    }
}

impl fmt::Debug for WeakCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCallback")
            .field("chained", &self.is_chained())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct WeakReferrer {
    slot: usize,
    callback: Option<Arc<WeakCallback>>,
}

impl ProbeEntry for WeakReferrer {
    fn key(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
struct WeakEntry {
    referent: usize,
    referrers: ProbeTable<WeakReferrer>,
}

impl ProbeEntry for WeakEntry {
    fn key(&self) -> usize {
        self.referent
    }
}

/// Result of clearing the registrations of a batch of garbage.
#[derive(Debug, Default)]
pub struct WeakClearOutcome {
    /// Slots nulled
    pub cleared: usize,
    /// Head of the chain of callbacks to invoke, if any were attached
    pub callbacks: Option<Arc<WeakCallback>>,
}

#[derive(Default)]
struct WeakTableInner {
    entries: ProbeTable<WeakEntry>,
    registrations: usize,
    #[cfg(test)]
    refuse_inserts: bool,
}

/// Zone-wide weak reference table.
#[derive(Default)]
pub struct WeakTable {
    inner: SpinLock<WeakTableInner>,
}

#[inline]
unsafe fn cell<'a>(slot: usize) -> &'a AtomicUsize {
    &*(slot as *const AtomicUsize)
}

impl WeakTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slot` as a weak reference to `referent` and store
    /// `referent` into it. A previous registration held by the slot is
    /// dropped first. Registering the null referent only unregisters.
    ///
    /// # Safety
    /// `slot` must be the address of a word-aligned cell that stays valid
    /// until it is unregistered or cleared.
    pub unsafe fn register(
        &self,
        referent: usize,
        slot: usize,
        callback: Option<Arc<WeakCallback>>,
    ) {
        let mut inner = self.inner.lock();
        let target = cell(slot);
        let previous = target.load(Ordering::Acquire);
        if previous != 0 {
            inner.unregister(previous, slot);
        }
        if referent == 0 {
            target.store(0, Ordering::Release);
            return;
        }
        // An unregistered slot must not keep its old referent.
        let value = if inner.add_referrer(referent, WeakReferrer { slot, callback }) {
            referent
        } else {
            0
        };
        target.store(value, Ordering::Release);
    }

    /// Drop the registration of `slot` against `referent`, nulling the slot
    /// if it still refers to `referent`.
    ///
    /// # Safety
    /// Same contract as [`WeakTable::register`].
    pub unsafe fn unregister(&self, referent: usize, slot: usize) {
        let mut inner = self.inner.lock();
        if inner.unregister(referent, slot) {
            let _ = cell(slot).compare_exchange(referent, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Null every slot registered against an address in `garbage` and
    /// remove their entries.
    ///
    /// `owner` describes the block containing a slot (address and layout)
    /// for diagnostics when a slot no longer holds its referent.
    ///
    /// # Safety
    /// Every registered slot must still be valid.
    pub unsafe fn clear_references(
        &self,
        garbage: &[usize],
        owner: impl Fn(usize) -> Option<(usize, BlockLayout)>,
    ) -> WeakClearOutcome {
        let mut outcome = WeakClearOutcome::default();
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return outcome;
        }
        for &referent in garbage {
            let Some(entry) = inner.entries.remove(referent) else {
                continue;
            };
            inner.registrations -= entry.referrers.len();
            for (_, referrer) in entry.referrers.iter() {
                let target = cell(referrer.slot);
                let found = target.load(Ordering::Acquire);
                if found != referent {
                    let (block, layout) = owner(referrer.slot).unwrap_or((0, BlockLayout::empty()));
                    warn!(
                        target: "autozone::weak",
                        slot = referrer.slot,
                        expected = referent,
                        found,
                        block,
                        ?layout,
                        "weak slot no longer holds its referent"
                    );
                    continue;
                }
                target.store(0, Ordering::Release);
                outcome.cleared += 1;
                if let Some(callback) = &referrer.callback {
                    if !callback.chained.swap(true, Ordering::AcqRel) {
                        *callback.next.lock() = outcome.callbacks.take();
                        outcome.callbacks = Some(callback.clone());
                    }
                }
            }
        }
        outcome
    }

    /// Invoke a chain built by [`WeakTable::clear_references`].
    ///
    /// Each link is unchained before its callback runs, so a callback may
    /// re-register itself.
    pub fn call_callbacks(head: Option<Arc<WeakCallback>>) -> usize {
        let mut called = 0;
        let mut current = head;
        while let Some(callback) = current {
            current = callback.next.lock().take();
            callback.chained.store(false, Ordering::Release);
            (callback.func)();
            called += 1;
        }
        called
    }

    /// Drop every registration whose slot satisfies `dead` without writing
    /// to the slot. Used before the memory holding slots is reused.
    pub fn forget_slots(&self, dead: impl Fn(usize) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let mut doomed = Vec::new();
        for (_, entry) in inner.entries.iter() {
            for (_, referrer) in entry.referrers.iter() {
                if dead(referrer.slot) {
                    doomed.push((entry.referent, referrer.slot));
                }
            }
        }
        for &(referent, slot) in &doomed {
            inner.unregister(referent, slot);
        }
        doomed.len()
    }

    /// True if `referent` has at least one registration
    pub fn is_registered(&self, referent: usize) -> bool {
        self.inner.lock().entries.find(referent).is_some()
    }

    /// Number of slots registered against `referent`
    pub fn referrer_count(&self, referent: usize) -> usize {
        self.inner
            .lock()
            .entries
            .lookup(referent)
            .map_or(0, |entry| entry.referrers.len())
    }

    /// Number of referents with registrations
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total registered slots
    pub fn registrations(&self) -> usize {
        self.inner.lock().registrations
    }

    /// Check the probing invariants of the table and every referrer array:
    /// each tracked displacement bound covers the true maximum, and the
    /// referent table always keeps a free slot.
    pub fn check_invariants(&self) -> bool {
        let inner = self.inner.lock();
        let table_ok = inner.entries.allocated() == 0
            || (inner.entries.len() < inner.entries.allocated()
                && inner.entries.max_displacement() >= inner.entries.true_max_displacement());
        table_ok
            && inner.entries.iter().all(|(_, entry)| {
                let referrers = &entry.referrers;
                referrers.len() <= referrers.allocated()
                    && referrers.max_displacement() >= referrers.true_max_displacement()
            })
    }
}

impl WeakTableInner {
    fn grow_table_maybe(&mut self) {
        let allocated = self.entries.allocated();
        if (self.entries.len() + 1) * 4 > allocated * 3 {
            let size = (allocated * 2 + 1).max(WEAK_TABLE_MIN_SIZE);
            if self.entries.resize(size).is_err() {
                error!(target: "autozone::weak", size, "no room for new entry");
            }
        }
    }

    fn add_referrer(&mut self, referent: usize, referrer: WeakReferrer) -> bool {
        #[cfg(test)]
        if self.refuse_inserts {
            error!(target: "autozone::weak", referent, "no room for new entry");
            return false;
        }
        let index = match self.entries.find(referent) {
            Some(index) => index,
            None => {
                self.grow_table_maybe();
                let entry = WeakEntry {
                    referent,
                    referrers: ProbeTable::new(),
                };
                match self.entries.insert(entry) {
                    Ok(index) => index,
                    Err(err) => {
                        error!(target: "autozone::weak", referent, "{err}");
                        return false;
                    }
                }
            }
        };
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        let referrers = &mut entry.referrers;
        if referrers.find(referrer.slot).is_some() {
            return true;
        }
        grow_referrers_maybe(referrers);
        match referrers.insert(referrer) {
            Ok(_) => {
                self.registrations += 1;
                true
            }
            Err(err) => {
                error!(target: "autozone::weak", referent, "{err}");
                false
            }
        }
    }

    fn unregister(&mut self, referent: usize, slot: usize) -> bool {
        let Some(index) = self.entries.find(referent) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        let Some(position) = entry.referrers.find(slot) else {
            return false;
        };
        entry.referrers.vacate(position);
        self.registrations -= 1;
        if entry.referrers.is_empty() {
            self.entries.remove_at(index);
        }
        true
    }
}

fn grow_referrers_maybe(referrers: &mut ProbeTable<WeakReferrer>) {
    let refs = referrers.len();
    let allocated = referrers.allocated();
    let crowded = refs >= REFERRERS_DOUBLING_THRESHOLD && refs * 3 >= allocated * 2;
    if refs < allocated && !crowded {
        return;
    }
    let mut size = if allocated < REFERRERS_DOUBLING_THRESHOLD {
        allocated + 1
    } else {
        allocated * 2
    };
    if size > REFERRERS_DOUBLING_THRESHOLD && size % 2 == 0 {
        size -= 1;
    }
    if referrers.resize(size).is_err() {
        error!(target: "autozone::weak", size, "no room for new entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    fn slots(n: usize) -> Vec<AtomicUsize> {
        (0..n).map(|_| AtomicUsize::new(0)).collect()
    }

    fn addr(slot: &AtomicUsize) -> usize {
        slot as *const AtomicUsize as usize
    }

    #[test]
    fn test_register_stores_referent() {
        let table = WeakTable::new();
        let slot = AtomicUsize::new(0);
        unsafe { table.register(0x1000, addr(&slot), None) };
        assert_eq!(slot.load(Ordering::Relaxed), 0x1000);
        assert!(table.is_registered(0x1000));
        assert_eq!(table.registrations(), 1);
    }

    #[test]
    fn test_reregister_replaces_previous() {
        let table = WeakTable::new();
        let slot = AtomicUsize::new(0);
        unsafe {
            table.register(0x1000, addr(&slot), None);
            table.register(0x2000, addr(&slot), None);
        }
        assert!(!table.is_registered(0x1000));
        assert_eq!(table.referrer_count(0x2000), 1);
        assert_eq!(slot.load(Ordering::Relaxed), 0x2000);
    }

    #[test]
    fn test_failed_register_leaves_slot_null() {
        let table = WeakTable::new();
        let slot = AtomicUsize::new(0);
        unsafe { table.register(0x1000, addr(&slot), None) };
        table.inner.lock().refuse_inserts = true;

        unsafe { table.register(0x2000, addr(&slot), None) };
        assert_eq!(slot.load(Ordering::Relaxed), 0);
        assert!(!table.is_registered(0x1000));
        assert!(!table.is_registered(0x2000));
        assert_eq!(table.registrations(), 0);
        assert!(table.check_invariants());
    }

    #[test]
    fn test_unregister_last_removes_entry() {
        let table = WeakTable::new();
        let cells = slots(2);
        unsafe {
            table.register(0x1000, addr(&cells[0]), None);
            table.register(0x1000, addr(&cells[1]), None);
            table.unregister(0x1000, addr(&cells[0]));
        }
        assert_eq!(table.referrer_count(0x1000), 1);
        assert_eq!(cells[0].load(Ordering::Relaxed), 0);
        unsafe { table.unregister(0x1000, addr(&cells[1])) };
        assert!(table.is_empty());
        assert_eq!(table.registrations(), 0);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let table = WeakTable::new();
        let slot = AtomicUsize::new(0);
        unsafe { table.register(0x3000, addr(&slot), None) };
        let first = unsafe { table.clear_references(&[0x3000], |_| None) };
        assert_eq!(first.cleared, 1);
        assert_eq!(slot.load(Ordering::Relaxed), 0);
        let second = unsafe { table.clear_references(&[0x3000], |_| None) };
        assert_eq!(second.cleared, 0);
        assert!(second.callbacks.is_none());
    }

    #[test]
    fn test_inconsistent_slot_is_skipped() {
        let table = WeakTable::new();
        let slot = AtomicUsize::new(0);
        unsafe { table.register(0x3000, addr(&slot), None) };
        slot.store(0x9999, Ordering::Relaxed);
        let outcome = unsafe { table.clear_references(&[0x3000], |_| None) };
        assert_eq!(outcome.cleared, 0);
        assert_eq!(slot.load(Ordering::Relaxed), 0x9999);
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_callback_chained_once() {
        let table = WeakTable::new();
        let cells = slots(3);
        let calls = Arc::new(Counter::new(0));
        let counter = calls.clone();
        let callback = WeakCallback::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        unsafe {
            for cell in &cells {
                table.register(0x4000, addr(cell), Some(callback.clone()));
            }
        }
        let outcome = unsafe { table.clear_references(&[0x4000], |_| None) };
        assert_eq!(outcome.cleared, 3);
        assert!(callback.is_chained());
        assert_eq!(WeakTable::call_callbacks(outcome.callbacks), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!callback.is_chained());
    }

    #[test]
    fn test_referrer_growth_sizes() {
        let mut referrers: ProbeTable<WeakReferrer> = ProbeTable::new();
        let mut sizes = Vec::new();
        for slot in 0..40usize {
            grow_referrers_maybe(&mut referrers);
            sizes.push(referrers.allocated());
            referrers
                .insert(WeakReferrer {
                    slot: 0x100 + slot * 8,
                    callback: None,
                })
                .unwrap();
        }
        assert_eq!(&sizes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(sizes.iter().filter(|&&s| s > 8).all(|s| s % 2 == 1));
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_table_growth_keeps_invariants() {
        let table = WeakTable::new();
        let cells = slots(200);
        for (i, cell) in cells.iter().enumerate() {
            unsafe { table.register(0x10_000 + i * 16, addr(cell), None) };
            assert!(table.check_invariants());
        }
        assert_eq!(table.len(), 200);
        for (i, cell) in cells.iter().enumerate().step_by(3) {
            unsafe { table.unregister(0x10_000 + i * 16, addr(cell)) };
        }
        assert!(table.check_invariants());
        for (i, cell) in cells.iter().enumerate() {
            let expect = if i % 3 == 0 { 0 } else { 0x10_000 + i * 16 };
            assert_eq!(cell.load(Ordering::Relaxed), expect);
        }
    }

    #[test]
    fn test_forget_slots_leaves_memory_alone() {
        let table = WeakTable::new();
        let cells = slots(3);
        unsafe {
            table.register(0x4000, addr(&cells[0]), None);
            table.register(0x4000, addr(&cells[1]), None);
            table.register(0x5000, addr(&cells[2]), None);
        }
        let dead = addr(&cells[1]);
        assert_eq!(table.forget_slots(|slot| slot == dead), 1);
        assert_eq!(table.referrer_count(0x4000), 1);
        assert_eq!(cells[1].load(Ordering::Relaxed), 0x4000);
        let dead = addr(&cells[2]);
        assert_eq!(table.forget_slots(|slot| slot == dead), 1);
        assert!(!table.is_registered(0x5000));
        assert_eq!(table.registrations(), 1);
    }
}
