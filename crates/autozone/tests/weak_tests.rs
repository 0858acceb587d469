//! Weak Reference Tests
//!
//! Weak slots live in memory owned by the tests (boxed words) or inside
//! managed blocks; referents are global blocks allocated from an
//! unregistered thread unless a test says otherwise.

mod common;

use autozone::heap;
use autozone::{CollectOptions, WeakCallback};
use common::{cell_address, manual_zone, scanned};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn full(zone: &autozone::Zone) {
    zone.collect(CollectOptions::FULL | CollectOptions::SYNCHRONOUS);
}

fn counting_callback() -> (Arc<WeakCallback>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let callback = WeakCallback::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (callback, calls)
}

// ===== Clearing =====

#[test]
fn test_weak_slot_cleared_when_referent_dies() {
    let zone = manual_zone();
    let referent = scanned(&zone, 32);
    let slot = Box::new(0usize);
    let slot_addr = cell_address(&slot);

    unsafe {
        zone.weak_register(referent, slot_addr, None);
        assert_eq!(zone.weak_read(slot_addr), referent);
    }
    assert!(zone.weak_table().is_registered(referent));

    full(&zone);
    unsafe { assert_eq!(zone.weak_read(slot_addr), 0) };
    assert!(!zone.weak_table().is_registered(referent));
    assert_eq!(zone.statistics().weak_cleared, 1);

    full(&zone);
    unsafe { assert_eq!(zone.weak_read(slot_addr), 0) };
    assert_eq!(zone.statistics().weak_cleared, 1);
    assert!(zone.weak_table().check_invariants());
}

#[test]
fn test_weak_slot_survives_while_referent_is_rooted() {
    let zone = manual_zone();
    let referent = scanned(&zone, 32);
    let root = Box::new(referent);
    let slot = Box::new(0usize);
    unsafe {
        zone.add_root(cell_address(&root));
        zone.weak_register(referent, cell_address(&slot), None);
    }

    full(&zone);
    unsafe { assert_eq!(zone.weak_read(cell_address(&slot)), referent) };
    assert_eq!(zone.weak_table().referrer_count(referent), 1);

    zone.remove_root(cell_address(&root));
    full(&zone);
    unsafe { assert_eq!(zone.weak_read(cell_address(&slot)), 0) };
}

#[test]
fn test_callbacks_run_once_per_collection() {
    let zone = manual_zone();
    let referent = scanned(&zone, 64);
    let first = Box::new(0usize);
    let second = Box::new(0usize);
    let shared = Box::new(0usize);
    let (callback_a, calls_a) = counting_callback();
    let (callback_b, calls_b) = counting_callback();

    unsafe {
        zone.weak_register(referent, cell_address(&first), Some(callback_a.clone()));
        zone.weak_register(referent, cell_address(&second), Some(callback_b));
        zone.weak_register(referent, cell_address(&shared), Some(callback_a.clone()));
    }
    assert_eq!(zone.weak_table().referrer_count(referent), 3);

    full(&zone);
    for slot in [&first, &shared, &second] {
        unsafe { assert_eq!(heap::load_word(cell_address(slot)), 0) };
    }
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert!(!callback_a.is_chained());
    assert_eq!(zone.statistics().weak_cleared, 3);
}

#[test]
fn test_callback_can_be_reused_after_it_runs() {
    let zone = manual_zone();
    let (callback, calls) = counting_callback();
    let slot = Box::new(0usize);

    for round in 1..=2 {
        let referent = scanned(&zone, 32);
        unsafe { zone.weak_register(referent, cell_address(&slot), Some(callback.clone())) };
        full(&zone);
        assert_eq!(calls.load(Ordering::SeqCst), round);
    }
}

#[test]
fn test_deallocating_referent_runs_callback_and_frees_it_for_reuse() {
    let zone = manual_zone();
    let (callback, calls) = counting_callback();
    let slot = Box::new(0usize);

    let first = scanned(&zone, 32);
    unsafe { zone.weak_register(first, cell_address(&slot), Some(callback.clone())) };
    zone.deallocate(first).unwrap();
    unsafe { assert_eq!(zone.weak_read(cell_address(&slot)), 0) };
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!callback.is_chained());

    let second = scanned(&zone, 32);
    unsafe { zone.weak_register(second, cell_address(&slot), Some(callback.clone())) };
    full(&zone);
    unsafe { assert_eq!(zone.weak_read(cell_address(&slot)), 0) };
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!callback.is_chained());
    assert_eq!(zone.statistics().weak_cleared, 2);
}

// ===== Registration =====

#[test]
fn test_many_referrers_grow_and_shrink() {
    let zone = manual_zone();
    let referent = scanned(&zone, 32);
    let root = Box::new(referent);
    unsafe { zone.add_root(cell_address(&root)) };

    let slots: Vec<Box<usize>> = (0..20).map(|_| Box::new(0usize)).collect();
    for slot in &slots {
        unsafe { zone.weak_register(referent, cell_address(slot), None) };
    }
    assert_eq!(zone.weak_table().referrer_count(referent), 20);
    assert!(zone.weak_table().check_invariants());

    for slot in slots.iter().step_by(2) {
        unsafe { zone.weak_unregister(referent, cell_address(slot)) };
    }
    assert_eq!(zone.weak_table().referrer_count(referent), 10);
    assert_eq!(zone.weak_table().registrations(), 10);
    assert!(zone.weak_table().check_invariants());

    for (i, slot) in slots.iter().enumerate() {
        let expected = if i % 2 == 0 { 0 } else { referent };
        unsafe { assert_eq!(heap::load_word(cell_address(slot)), expected) };
    }
}

#[test]
fn test_reregistering_a_slot_moves_it() {
    let zone = manual_zone();
    let a = scanned(&zone, 32);
    let b = scanned(&zone, 32);
    let roots = Box::new([a, b]);
    unsafe {
        zone.add_root(cell_address(&roots[0]));
        zone.add_root(cell_address(&roots[1]));
    }
    let slot = Box::new(0usize);
    unsafe {
        zone.weak_register(a, cell_address(&slot), None);
        zone.weak_register(b, cell_address(&slot), None);
        assert_eq!(zone.weak_read(cell_address(&slot)), b);
    }
    assert!(!zone.weak_table().is_registered(a));
    assert_eq!(zone.weak_table().referrer_count(b), 1);
}

#[test]
fn test_many_referents_keep_invariants() {
    let zone = manual_zone();
    let referents: Vec<usize> = (0..100).map(|_| scanned(&zone, 16)).collect();
    let slots: Vec<Box<usize>> = referents.iter().map(|_| Box::new(0usize)).collect();
    for (referent, slot) in referents.iter().zip(&slots) {
        unsafe { zone.weak_register(*referent, cell_address(slot), None) };
    }
    assert_eq!(zone.weak_table().len(), 100);
    assert!(zone.weak_table().check_invariants());

    full(&zone);
    assert!(zone.weak_table().is_empty());
    assert_eq!(zone.statistics().weak_cleared, 100);
    assert!(zone.weak_table().check_invariants());
}

// ===== Slots inside managed memory =====

#[test]
fn test_slot_in_dead_block_is_forgotten() {
    let zone = manual_zone();
    let referent = scanned(&zone, 32);
    let holder = scanned(&zone, 32);
    let root = Box::new(referent);
    unsafe {
        zone.add_root(cell_address(&root));
        zone.weak_register(referent, holder + 8, None);
    }
    assert_eq!(zone.weak_table().registrations(), 1);

    full(&zone);
    assert_eq!(zone.size(holder), None);
    assert!(zone.size(referent).is_some());
    assert_eq!(zone.weak_table().registrations(), 0);
}

#[test]
fn test_deallocating_holder_forgets_slot() {
    let zone = manual_zone();
    let referent = scanned(&zone, 32);
    let holder = scanned(&zone, 64);
    unsafe { zone.weak_register(referent, holder, None) };

    zone.deallocate(holder).unwrap();
    assert_eq!(zone.weak_table().registrations(), 0);
}

#[test]
fn test_registering_local_referent_escapes_it() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();
    let referent = scanned(&zone, 32);
    assert!(zone.is_thread_local(referent));

    let slot = Box::new(0usize);
    unsafe { zone.weak_register(referent, cell_address(&slot), None) };
    assert!(!zone.is_thread_local(referent));
    assert_eq!(thread.local_count(), 0);

    zone.unregister_thread().unwrap();
}
