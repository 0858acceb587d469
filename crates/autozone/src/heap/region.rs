//! Backing reservation carved into subzones
//!
//! The region is one contiguous, subzone-aligned span of zeroed memory.
//! Subzones are carved from it on demand and never returned; the whole
//! reservation is released when the zone drops.

use super::layout::SizeClass;
use super::subzone::Subzone;
use crate::defaults::{SUBZONE_SHIFT, SUBZONE_SIZE};
use crate::{ZoneError, ZoneResult};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Subzone-aligned reservation backing every small and medium block.
pub struct Region {
    base: usize,
    size: usize,
    mapping: Mapping,
    slots: Box<[OnceCell<Subzone>]>,
    next: AtomicUsize,
}

impl Region {
    /// Reserve `size` bytes, rounded up to whole subzones.
    pub fn new(size: usize) -> ZoneResult<Self> {
        let count = size.div_ceil(SUBZONE_SIZE).max(1);
        let size = count << SUBZONE_SHIFT;
        let mapping = Mapping::reserve(size)?;
        let slots = (0..count).map(|_| OnceCell::new()).collect();
        Ok(Self {
            base: mapping.aligned,
            size,
            mapping,
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// First address of the region
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bytes reserved
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True if `addr` lies inside the reservation
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    /// Carve the next unused subzone for the admin at `admin`.
    ///
    /// Returns `None` once the reservation is exhausted.
    pub fn carve(&self, class: SizeClass, admin: usize) -> Option<&Subzone> {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index >= self.slots.len() {
            self.next.store(self.slots.len(), Ordering::Release);
            return None;
        }
        let base = self.base + (index << SUBZONE_SHIFT);
        Some(self.slots[index].get_or_init(|| Subzone::new(base, class, admin)))
    }

    /// Subzone covering `addr`, if it has been carved
    #[inline]
    pub fn subzone_for(&self, addr: usize) -> Option<&Subzone> {
        if !self.contains(addr) {
            return None;
        }
        self.slots[(addr - self.base) >> SUBZONE_SHIFT].get()
    }

    /// Every carved subzone, in address order
    pub fn subzones(&self) -> impl Iterator<Item = &Subzone> {
        let carved = self.next.load(Ordering::Acquire).min(self.slots.len());
        self.slots[..carved].iter().filter_map(OnceCell::get)
    }

    /// Number of subzones carved so far
    pub fn carved(&self) -> usize {
        self.subzones().count()
    }

    /// Return the physical pages of `[start, start + len)` to the system.
    ///
    /// The range must be page aligned and lie in free memory. Reads of the
    /// range afterwards observe zeros.
    pub fn purge(&self, start: usize, len: usize) {
        debug_assert!(self.contains(start) && self.contains(start + len - 1));
        self.mapping.discard(start, len);
    }
}

struct Mapping {
    raw: usize,
    len: usize,
    aligned: usize,
}

#[cfg(unix)]
impl Mapping {
    fn reserve(size: usize) -> ZoneResult<Self> {
        let len = size + SUBZONE_SIZE;
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ZoneError::Exhausted { size });
        }
        let raw = ptr as usize;
        let aligned = (raw + SUBZONE_SIZE - 1) & !(SUBZONE_SIZE - 1);
        Ok(Self { raw, len, aligned })
    }

    fn discard(&self, start: usize, len: usize) {
        // SAFETY: the range lies inside our own mapping.
        let rc = unsafe { libc::madvise(start as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            tracing::debug!(target: "autozone::gc", start, len, "madvise failed, zeroing instead");
            zero(start, len);
        }
    }
}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `raw`/`len` are exactly what mmap returned.
        unsafe {
            libc::munmap(self.raw as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(not(unix))]
impl Mapping {
    fn layout(len: usize) -> std::alloc::Layout {
        // SUBZONE_SIZE is a power of two and len is a multiple of it.
        std::alloc::Layout::from_size_align(len, SUBZONE_SIZE).unwrap_or_else(|_| unreachable!())
    }

    fn reserve(size: usize) -> ZoneResult<Self> {
        // SAFETY: non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(Self::layout(size)) };
        if ptr.is_null() {
            return Err(ZoneError::Exhausted { size });
        }
        let raw = ptr as usize;
        Ok(Self {
            raw,
            len: size,
            aligned: raw,
        })
    }

    fn discard(&self, start: usize, len: usize) {
        zero(start, len);
    }
}

#[cfg(not(unix))]
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: allocated in `reserve` with the same layout.
        unsafe { std::alloc::dealloc(self.raw as *mut u8, Self::layout(self.len)) }
    }
}

/// Zero a word-aligned range with atomic stores so concurrent conservative
/// readers never race a plain write.
pub(crate) fn zero(start: usize, len: usize) {
    let mut addr = start;
    let end = start + len;
    while addr < end {
        // SAFETY: callers pass memory owned by the heap.
        unsafe { super::store_word(addr, 0) };
        addr += std::mem::size_of::<usize>();
    }
}
