//! Quantized 1 MiB storage owned by one admin

use super::layout::{BlockFlags, QuantumMeta, SizeClass};
use crate::defaults::{CARD_SHIFT, SUBZONE_SHIFT, SUBZONE_SIZE};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// One subzone: fixed quantum size, side-table metadata, and a card table.
pub struct Subzone {
    base: usize,
    class: SizeClass,
    admin: usize,
    meta: Box<[QuantumMeta]>,
    cards: Box<[AtomicU8]>,
    high_water: AtomicUsize,
}

impl Subzone {
    pub(super) fn new(base: usize, class: SizeClass, admin: usize) -> Self {
        debug_assert_eq!(base % SUBZONE_SIZE, 0);
        let quanta = SUBZONE_SIZE >> class.quantum_shift();
        Self {
            base,
            class,
            admin,
            meta: (0..quanta).map(|_| QuantumMeta::default()).collect(),
            cards: (0..SUBZONE_SIZE >> CARD_SHIFT)
                .map(|_| AtomicU8::new(0))
                .collect(),
            high_water: AtomicUsize::new(0),
        }
    }

    /// First address
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size class of every block in this subzone
    #[inline]
    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Index of the owning admin in the partition
    #[inline]
    pub fn admin(&self) -> usize {
        self.admin
    }

    /// log2 of the quantum size
    #[inline]
    pub fn quantum_shift(&self) -> usize {
        self.class.quantum_shift()
    }

    /// Total quanta
    #[inline]
    pub fn quantum_count(&self) -> usize {
        self.meta.len()
    }

    /// Quantum index containing `addr`
    #[inline]
    pub fn quantum_index(&self, addr: usize) -> usize {
        debug_assert!(addr >> SUBZONE_SHIFT == self.base >> SUBZONE_SHIFT);
        (addr - self.base) >> self.quantum_shift()
    }

    /// Address of quantum `index`
    #[inline]
    pub fn quantum_address(&self, index: usize) -> usize {
        self.base + (index << self.quantum_shift())
    }

    /// True if `addr` is quantum aligned
    #[inline]
    pub fn is_quantum_aligned(&self, addr: usize) -> bool {
        addr & ((1 << self.quantum_shift()) - 1) == 0
    }

    /// Metadata of quantum `index`
    #[inline]
    pub fn meta(&self, index: usize) -> &QuantumMeta {
        &self.meta[index]
    }

    /// Size in bytes of the block or free run starting at `index`
    #[inline]
    pub fn run_size(&self, index: usize) -> usize {
        (self.meta[index].quanta() as usize) << self.quantum_shift()
    }

    /// Quantum index of the allocated block starting exactly at `addr`
    pub fn block_at(&self, addr: usize) -> Option<usize> {
        if !self.is_quantum_aligned(addr) {
            return None;
        }
        let index = self.quantum_index(addr);
        if index >= self.high_water() {
            return None;
        }
        let flags = self.meta[index].flags();
        (flags.contains(BlockFlags::START) && !flags.contains(BlockFlags::FREE)).then_some(index)
    }

    /// Quantum index of the allocated block containing `addr`
    pub fn block_containing(&self, addr: usize) -> Option<usize> {
        let target = self.quantum_index(addr);
        if target >= self.high_water() {
            return None;
        }
        let max_quanta = self.class.max_quanta();
        let floor = target.saturating_sub(max_quanta - 1);
        (floor..=target).rev().find_map(|index| {
            let meta = &self.meta[index];
            let flags = meta.flags();
            if !flags.contains(BlockFlags::START) || flags.contains(BlockFlags::FREE) {
                return None;
            }
            (index + meta.quanta() as usize > target).then_some(index)
        })
    }

    /// Quanta handed out by the bump cursor so far
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    pub(super) fn advance_high_water(&self, quanta: usize) {
        self.high_water.fetch_max(quanta, Ordering::AcqRel);
    }

    /// Visit every allocated block start below the high-water mark.
    pub fn for_each_block(&self, mut f: impl FnMut(usize, &QuantumMeta)) {
        let end = self.high_water();
        let mut index = 0;
        while index < end {
            let meta = &self.meta[index];
            let flags = meta.flags();
            let step = meta.quanta().max(1) as usize;
            if flags.contains(BlockFlags::START) && !flags.contains(BlockFlags::FREE) {
                f(index, meta);
                index += step;
            } else if flags.contains(BlockFlags::FREE) {
                index += step;
            } else {
                index += 1;
            }
        }
    }

    /// Mark the card covering `addr` dirty
    #[inline]
    pub fn dirty_card(&self, addr: usize) {
        self.cards[(addr - self.base) >> CARD_SHIFT].store(1, Ordering::Release);
    }

    /// Mark every card of the block at `index` dirty
    pub fn dirty_block_cards(&self, index: usize) {
        let (first, last) = self.card_span(index);
        for card in &self.cards[first..=last] {
            card.store(1, Ordering::Release);
        }
    }

    /// Word ranges of the block at `index` covered by dirty cards
    pub fn dirty_ranges(&self, index: usize) -> Vec<(usize, usize)> {
        let start = self.quantum_address(index);
        let end = start + self.run_size(index);
        let (first, last) = self.card_span(index);
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for card in first..=last {
            if self.cards[card].load(Ordering::Acquire) == 0 {
                continue;
            }
            let lo = (self.base + (card << CARD_SHIFT)).max(start);
            let hi = (self.base + ((card + 1) << CARD_SHIFT)).min(end);
            match ranges.last_mut() {
                Some(last) if last.1 == lo => last.1 = hi,
                _ => ranges.push((lo, hi)),
            }
        }
        ranges
    }

    /// Clear every card
    pub fn clear_cards(&self) {
        for card in self.cards.iter() {
            card.store(0, Ordering::Relaxed);
        }
    }

    fn card_span(&self, index: usize) -> (usize, usize) {
        let start = self.quantum_address(index) - self.base;
        let end = start + self.run_size(index).max(1) - 1;
        (start >> CARD_SHIFT, end >> CARD_SHIFT)
    }
}

impl std::fmt::Debug for Subzone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subzone")
            .field("base", &format_args!("{:#x}", self.base))
            .field("class", &self.class)
            .field("admin", &self.admin)
            .field("high_water", &self.high_water())
            .finish()
    }
}
