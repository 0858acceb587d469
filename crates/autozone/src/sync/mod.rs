//! Lock primitives used throughout the collector
//!
//! Every lock is scoped: acquisition produces a guard and dropping the guard
//! releases the lock on every exit path, unwinding included.
//!
//! - `SpinLock` / `SpinLock::try_lock`: short critical sections (admins, weak table)
//! - `Mutex` / `Mutex::try_lock`: blocking sections (pending counters, locals)
//! - `RwLock::read` / `RwLock::write` / `RwLock::try_write`: phase and large-block maps
//! - `ConditionBarrier` / `UnconditionalBarrier`: enlivening flag + lock pairs
//! - `Sentinel`: reentrancy detection
//!
//! The non-blocking variants return `Option<guard>`; `is_some()` is the success
//! flag and nothing is released when acquisition failed.

mod barrier;
mod sentinel;
mod spin;

pub use barrier::{ConditionBarrier, LockedBoolean, UnconditionalBarrier};
pub use parking_lot::{
    Mutex, MutexGuard, RwLock, RwLockReadGuard as ReadGuard, RwLockWriteGuard as WriteGuard,
};
pub use sentinel::{Sentinel, SentinelCounter};
pub use spin::{SpinGuard, SpinLock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_try_lock_scoping() {
        let mutex = Mutex::new(0u8);
        {
            let _held = mutex.lock();
            assert!(mutex.try_lock().is_none());
        }
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_rwlock_try_write_scoping() {
        let lock = RwLock::new(());
        {
            let _reader = lock.read();
            assert!(lock.try_write().is_none());
        }
        assert!(lock.try_write().is_some());
    }
}
