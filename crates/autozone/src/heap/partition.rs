//! The fixed set of admins backing small and medium allocation

use super::admin::{Admin, AdminState};
use super::layout::{BlockLayout, SizeClass};
use super::region::Region;
use crate::sync::SpinGuard;

/// Number of admins: 2 size classes x scanned/unscanned x retained-once or not.
pub const ADMIN_COUNT: usize = 8;

/// Fixed array of admins keyed by size class, scan layout, and retain state.
pub struct SubzonePartition {
    admins: [Admin; ADMIN_COUNT],
}

impl SubzonePartition {
    /// Create the eight admins
    pub fn new() -> Self {
        Self {
            admins: std::array::from_fn(|index| {
                let class = if index & 0b100 != 0 {
                    SizeClass::Medium
                } else {
                    SizeClass::Small
                };
                Admin::new(index, class)
            }),
        }
    }

    /// Bucket index for an allocation. Pure: same inputs, same index.
    #[inline]
    pub fn admin_index(size: usize, layout: BlockLayout, refcount_is_one: bool) -> usize {
        let medium = SizeClass::for_size(size) == SizeClass::Medium;
        (usize::from(medium) << 2)
            | (usize::from(layout.contains(BlockLayout::UNSCANNED)) << 1)
            | usize::from(refcount_is_one)
    }

    /// Admin serving an allocation
    #[inline]
    pub fn admin(&self, size: usize, layout: BlockLayout, refcount_is_one: bool) -> &Admin {
        &self.admins[Self::admin_index(size, layout, refcount_is_one)]
    }

    /// Admin at a known index
    #[inline]
    pub fn admin_at(&self, index: usize) -> &Admin {
        &self.admins[index]
    }

    /// Lock every admin in ascending order.
    pub fn lock(&self) -> PartitionGuard<'_> {
        PartitionGuard {
            guards: self.admins.iter().map(Admin::lock).collect(),
        }
    }

    /// True if any admin lock is currently held
    pub fn locked(&self) -> bool {
        self.admins.iter().any(Admin::is_locked)
    }

    /// Apply `f` to every admin
    pub fn for_each(&self, f: impl FnMut(&Admin)) {
        self.admins.iter().for_each(f);
    }

    /// Purge free pages of every admin, taking each admin lock in turn.
    pub fn purge_free_space(&self, region: &Region) -> usize {
        let mut purged = 0;
        self.for_each(|admin| purged += admin.purge_free_space(region));
        purged
    }

    /// Purge free pages while the caller already holds the whole partition.
    pub fn purge_free_space_no_lock(guard: &mut PartitionGuard<'_>, region: &Region) -> usize {
        guard
            .guards
            .iter_mut()
            .map(|state| state.purge_free_space(region))
            .sum()
    }
}

impl Default for SubzonePartition {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds every admin lock; releases them in reverse order on drop.
pub struct PartitionGuard<'a> {
    guards: Vec<SpinGuard<'a, AdminState>>,
}

impl PartitionGuard<'_> {
    /// Locked state of the admin at `index`
    pub fn state(&mut self, index: usize) -> &mut AdminState {
        &mut self.guards[index]
    }
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
