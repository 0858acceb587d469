//! Hooks the embedding runtime provides to the collector

use crate::heap::BlockLayout;
use crate::thread::Thread;
use std::sync::Arc;

/// Callbacks into the host object model.
///
/// Every method has a default so embedders only override what they need.
/// Hooks run on collector paths: they must not call back into collection
/// entry points of the same zone.
pub trait CollectorHost: Send + Sync {
    /// Garbage is about to be finalized. Blocks are still readable.
    fn invalidate_garbage(&self, _garbage: &[usize]) {}

    /// Garbage is about to be returned to the allocator.
    fn free_garbage(&self, _garbage: &[usize]) {}

    /// A thread-local block found unreachable still carries retains.
    fn over_retained(&self, _block: usize) {}

    /// Byte offsets of the pointer words in `block`, if the layout is known
    /// precisely. `None` makes the collectors scan every word.
    fn pointer_map(&self, _block: usize, _layout: BlockLayout) -> Option<Arc<[usize]>> {
        None
    }

    /// Internal bookkeeping could not be allocated.
    fn fatal(&self, message: &str) -> ! {
        tracing::error!(target: "autozone::gc", "{message}");
        panic!("autozone: {message}");
    }
}

/// Host with every hook left at its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHost;

impl CollectorHost for DefaultHost {}

/// A half-open, word-aligned address range scanned conservatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordRange {
    /// First address
    pub start: usize,
    /// One past the last address
    pub end: usize,
}

impl WordRange {
    /// Range spanning `[start, end)`
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Range covering a slice of words
    pub fn from_slice(words: &[usize]) -> Self {
        let range = words.as_ptr_range();
        Self {
            start: range.start as usize,
            end: range.end as usize,
        }
    }

    /// True if the range holds no whole word
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whole words covered
    pub fn words(&self) -> usize {
        self.end.saturating_sub(self.start) / std::mem::size_of::<usize>()
    }
}

/// Enumerates the root ranges (stack and saved registers) of a thread.
pub trait StackEnumerator: Send + Sync {
    /// Ranges to scan for `thread`
    fn ranges(&self, thread: &Thread) -> Vec<WordRange>;
}

/// Scans whatever ranges each thread published through
/// [`Thread::set_stack_ranges`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishedStacks;

impl StackEnumerator for PublishedStacks {
    fn ranges(&self, thread: &Thread) -> Vec<WordRange> {
        thread.stack_ranges()
    }
}
