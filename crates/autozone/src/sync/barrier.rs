//! Locked booleans and the condition barriers built on them
//!
//! The enlivening write barrier must not lock in the common case where no
//! collection is scanning. A `LockedBoolean` pairs a flag with a spin lock:
//! mutators test the flag without locking and only take the lock when the
//! flag is set, re-checking it afterwards.

use super::spin::{SpinGuard, SpinLock};
use std::sync::atomic::{AtomicBool, Ordering};

/// A boolean flag guarded together with a lock.
pub struct LockedBoolean {
    state: AtomicBool,
    lock: SpinLock<()>,
}

impl LockedBoolean {
    /// Create a locked boolean with an initial state
    pub const fn new(state: bool) -> Self {
        Self {
            state: AtomicBool::new(state),
            lock: SpinLock::new(()),
        }
    }

    /// Unlocked read of the flag.
    #[inline]
    pub fn get(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

impl Default for LockedBoolean {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Holds the lock of a `LockedBoolean` only if its flag is set.
pub struct ConditionBarrier<'a> {
    guard: Option<SpinGuard<'a, ()>>,
}

impl<'a> ConditionBarrier<'a> {
    /// Acquire the lock if the flag is set, re-checking once locked.
    pub fn new(boolean: &'a LockedBoolean) -> Self {
        if !boolean.get() {
            return Self { guard: None };
        }
        let guard = boolean.lock.lock();
        if !boolean.get() {
            drop(guard);
            return Self { guard: None };
        }
        Self { guard: Some(guard) }
    }

    /// True if the flag was set and the lock is held.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.guard.is_some()
    }
}

/// Always holds the lock of a `LockedBoolean` and may change its flag.
pub struct UnconditionalBarrier<'a> {
    boolean: &'a LockedBoolean,
    _guard: SpinGuard<'a, ()>,
}

impl<'a> UnconditionalBarrier<'a> {
    /// Acquire the lock regardless of the flag
    pub fn new(boolean: &'a LockedBoolean) -> Self {
        Self {
            boolean,
            _guard: boolean.lock.lock(),
        }
    }

    /// Current flag value
    pub fn get(&self) -> bool {
        self.boolean.get()
    }

    /// Change the flag while the lock is held
    pub fn set(&self, value: bool) {
        self.boolean.state.store(value, Ordering::Release);
    }
}
