//! Reentrancy sentinels

use std::sync::atomic::{AtomicU32, Ordering};

/// Counter tracking how many sentinels currently guard a region.
#[derive(Debug, Default)]
pub struct SentinelCounter(AtomicU32);

impl SentinelCounter {
    /// Create an unguarded counter
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Enter the guarded region until the returned sentinel drops
    pub fn enter(&self) -> Sentinel<'_> {
        Sentinel::new(self)
    }

    /// True while at least one sentinel is alive
    #[inline]
    pub fn is_guarded(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Debug check that the caller is inside a guarded region
    #[inline]
    pub fn assert_guarded(&self) {
        debug_assert!(self.is_guarded(), "sentinel region not entered");
    }

    /// Current nesting depth
    pub fn depth(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// RAII marker: increments the counter on construction, decrements on drop.
pub struct Sentinel<'a> {
    counter: &'a SentinelCounter,
}

impl<'a> Sentinel<'a> {
    /// Enter the region guarded by `counter`
    pub fn new(counter: &'a SentinelCounter) -> Self {
        counter.0.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for Sentinel<'_> {
    fn drop(&mut self) {
        self.counter.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting() {
        let counter = SentinelCounter::new();
        assert!(!counter.is_guarded());
        {
            let _outer = counter.enter();
            counter.assert_guarded();
            {
                let _inner = Sentinel::new(&counter);
                assert_eq!(counter.depth(), 2);
            }
            assert_eq!(counter.depth(), 1);
        }
        assert!(!counter.is_guarded());
    }
}
