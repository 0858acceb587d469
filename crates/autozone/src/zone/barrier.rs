//! Write barrier
//!
//! Every pointer store into managed memory goes through
//! [`Zone::write_barrier`]. In order, a store:
//!
//! 1. Catches resurrection: storing a condemned block into live memory
//!    retains it and turns it into a zombie.
//! 2. Escapes a thread-local value stored anywhere but another local.
//! 3. Enlivens the value while a collection scans, so the marker cannot
//!    miss it.
//! 4. Dirties the destination card when a young value lands in an old
//!    block.

use super::Zone;
use crate::heap::{self, Block, BlockFlags};
use crate::sync::ConditionBarrier;
use tracing::error;

impl Zone {
    /// Store `value` into `slot` with the collector's write barrier.
    ///
    /// # Safety
    /// `slot` must be a writable, word-aligned cell: inside an allocated
    /// block of this zone, a registered root, or memory the caller owns.
    pub unsafe fn write_barrier(&self, slot: usize, value: usize) {
        let dest = self.heap.block_containing(slot);
        let target = if value == 0 {
            None
        } else {
            self.heap.block(value)
        };
        if let Some(target) = &target {
            self.check_resurrection(dest.as_ref(), target);
        }

        let thread = self.current_thread();
        let thread = thread.as_deref();
        let escaping = thread.is_some()
            && target.as_ref().is_some_and(|target| {
                target.flags().contains(BlockFlags::THREAD_LOCAL)
                    && !target.flags().contains(BlockFlags::LOCAL_DEAD)
            })
            && dest
                .as_ref()
                .is_none_or(|dest| !dest.flags().contains(BlockFlags::THREAD_LOCAL));

        // Locals before the enlivening flag; the marker takes the flags
        // without ever taking a locals lock.
        let mut locals = match thread {
            Some(thread) if escaping => Some(thread.locals()),
            _ => None,
        };
        let barrier = ConditionBarrier::new(self.enlivening_flag(thread));
        if let Some(locals) = locals.as_deref_mut() {
            self.make_global_locked(thread, locals, value, barrier.is_set());
        } else if barrier.is_set() && target.is_some() {
            self.enliven_locked(thread, value);
        }
        heap::store_word(slot, value);
        drop(barrier);
        drop(locals);

        if let (Some(dest), Some(target)) = (&dest, &target) {
            if dest.meta().age() == 0 && target.meta().age() > 0 {
                dest.dirty_card(slot);
            }
        }
    }

    /// Load a word through the collector; no read barrier is needed.
    ///
    /// # Safety
    /// Same contract as [`Zone::write_barrier`].
    pub unsafe fn read_word(&self, slot: usize) -> usize {
        heap::load_word(slot)
    }

    fn check_resurrection(&self, dest: Option<&Block<'_>>, target: &Block<'_>) {
        let condemned = BlockFlags::GARBAGE | BlockFlags::LOCAL_DEAD;
        if !target.flags().intersects(condemned) {
            return;
        }
        // Garbage pointing at garbage is finalizer business, not resurrection.
        if dest.is_some_and(|dest| dest.flags().intersects(condemned)) {
            return;
        }
        let _phase = self.phase_lock.read();
        let meta = target.meta();
        if !meta.flags().intersects(condemned) || meta.test_and_set(BlockFlags::ZOMBIE) {
            return;
        }
        meta.retain();
        self.zombies.lock().push(target.address());
        self.stats.lock().resurrections += 1;
        error!(
            target: "autozone::gc",
            block = target.address(),
            size = target.size(),
            layout = ?target.layout(),
            destination = dest.map_or(0, |dest| dest.address()),
            "resurrected a block being finalized; it will survive one more collection"
        );
    }
}
