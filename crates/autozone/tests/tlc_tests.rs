//! Thread-Local Collection Tests
//!
//! Each test registers the test thread with its own zone and publishes a
//! word buffer as the thread's stack, so the set of roots a thread-local
//! collection sees is exactly what the test wrote into that buffer.
//!
//! # Running Tests
//! ```bash
//! cargo test --test tlc_tests
//! ```

mod common;

use autozone::heap;
use autozone::{BlockFlags, BlockLayout, CollectOptions, FinalizeMode, WordRange, ZoneError};
use common::{manual_config, manual_zone, recording_zone, scanned, sorted};

fn publish(thread: &autozone::Thread, stack: &[usize]) {
    unsafe { thread.set_stack_ranges(vec![WordRange::from_slice(stack)]) };
}

// ===== Reachability =====

#[test]
fn test_closure_keeps_reachable_locals() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();

    let b = scanned(&zone, 32);
    let c = scanned(&zone, 32);
    unsafe { zone.write_barrier(b + 8, c) };
    assert!(zone.is_thread_local(b));
    assert!(zone.is_thread_local(c));

    let stack = [0usize, b, 0, 0];
    publish(&thread, &stack);
    let outcome = zone.collect_local().unwrap();

    assert_eq!(outcome.marked, 2);
    assert!(outcome.garbage.is_empty());
    assert!(zone.is_thread_local(b));
    assert!(zone.is_thread_local(c));
    assert_eq!(thread.local_count(), 2);

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_unreachable_locals_are_garbage_exactly_once() {
    let (zone, host) = recording_zone(manual_config());
    let thread = zone.register_thread().unwrap();

    let live = scanned(&zone, 48);
    let dead = scanned(&zone, 48);
    let also_dead = scanned(&zone, 48);
    let stack = [live];
    publish(&thread, &stack);

    let outcome = zone.collect_local().unwrap();
    assert_eq!(outcome.marked, 1);
    assert_eq!(sorted(outcome.garbage.clone()), sorted(vec![dead, also_dead]));
    assert_eq!(outcome.scavenged, 2);
    assert_eq!(host.invalidated(), sorted(vec![dead, also_dead]));
    assert_eq!(host.freed(), sorted(vec![dead, also_dead]));

    assert!(zone.is_thread_local(live));
    assert_eq!(zone.size(dead), None);
    assert_eq!(zone.size(also_dead), None);
    assert_eq!(thread.local_count(), 1);
    assert_eq!(thread.cached_blocks(), 2);

    let reused = scanned(&zone, 48);
    assert!(reused == dead || reused == also_dead);
    assert!(zone.is_thread_local(reused));

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_interior_stack_word_does_not_keep_local() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();

    let block = scanned(&zone, 64);
    let stack = [block + 8];
    publish(&thread, &stack);

    let outcome = zone.collect_local().unwrap();
    assert_eq!(outcome.garbage, vec![block]);

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_escaped_block_is_not_collected_locally() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();

    let block = scanned(&zone, 32);
    let slot = Box::new(0usize);
    let slot_addr = common::cell_address(&slot);
    unsafe { zone.write_barrier(slot_addr, block) };
    assert!(!zone.is_thread_local(block));

    publish(&thread, &[]);
    let outcome = zone.collect_local().unwrap();
    assert!(outcome.garbage.is_empty());
    assert!(zone.size(block).is_some());

    zone.unregister_thread().unwrap();
}

// ===== Finalization =====

#[test]
fn test_released_block_is_invalidated_and_freed_once() {
    let (zone, host) = recording_zone(manual_config());
    let thread = zone.register_thread().unwrap();

    let block = zone.allocate(64, BlockLayout::SCANNED, true, true).unwrap();
    assert_eq!(zone.retain_count(block).unwrap(), 1);
    assert!(zone.is_thread_local(block));
    zone.release(block).unwrap();

    publish(&thread, &[]);
    let outcome = zone.collect_local_with(FinalizeMode::Now).unwrap();

    assert_eq!(outcome.garbage, vec![block]);
    assert_eq!(host.invalidated(), vec![block]);
    assert_eq!(host.freed(), vec![block]);
    assert_eq!(zone.size(block), None);

    zone.unregister_thread().unwrap();
}

#[test]
fn test_retained_local_garbage_becomes_global() {
    let (zone, host) = recording_zone(manual_config());
    let thread = zone.register_thread().unwrap();

    let block = zone.allocate(64, BlockLayout::SCANNED, true, true).unwrap();
    publish(&thread, &[]);
    let outcome = zone.collect_local().unwrap();

    assert_eq!(outcome.garbage, vec![block]);
    assert_eq!(outcome.retained, 1);
    assert_eq!(host.over_retained(), vec![block]);
    assert!(host.freed().is_empty());
    assert!(zone.size(block).is_some());
    assert!(!zone.is_thread_local(block));

    zone.unregister_thread().unwrap();
}

#[test]
fn test_full_cache_drops_blocks_to_global_heap() {
    let mut config = manual_config();
    config.thread_cache_limit = 1;
    let zone = autozone::Zone::new(config).unwrap();
    let thread = zone.register_thread().unwrap();

    let blocks: Vec<usize> = (0..3).map(|_| scanned(&zone, 32)).collect();
    publish(&thread, &[]);
    let outcome = zone.collect_local().unwrap();

    assert_eq!(outcome.garbage.len(), 3);
    assert_eq!(outcome.scavenged, 1);
    assert_eq!(outcome.dropped, 2);

    let survivors: Vec<usize> = blocks
        .iter()
        .copied()
        .filter(|&addr| zone.size(addr).is_some())
        .collect();
    assert_eq!(survivors.len(), 2);
    for &addr in &survivors {
        assert!(!zone.is_thread_local(addr));
        assert_eq!(zone.block_layout(addr), Some(BlockLayout::UNSCANNED));
    }

    zone.collect(CollectOptions::FULL | CollectOptions::SYNCHRONOUS);
    for addr in survivors {
        assert_eq!(zone.size(addr), None);
    }

    zone.unregister_thread().unwrap();
}

#[test]
fn test_later_mode_defers_to_collector_work() {
    let (zone, host) = recording_zone(manual_config());
    let thread = zone.register_thread().unwrap();

    let live = scanned(&zone, 32);
    let dead = scanned(&zone, 32);
    let stack = [live];
    publish(&thread, &stack);

    let outcome = zone.collect_local_with(FinalizeMode::Later).unwrap();
    assert_eq!(outcome.garbage, vec![dead]);
    assert!(host.freed().is_empty());
    let flags = zone.block_flags(dead).unwrap();
    assert!(flags.contains(BlockFlags::LOCAL_DEAD));
    assert!(!zone.is_thread_local(dead));
    assert_eq!(zone.queued_tasks(), 1);

    assert_eq!(zone.drain_tasks(), 1);
    assert_eq!(host.invalidated(), vec![dead]);
    assert_eq!(host.freed(), vec![dead]);
    assert_eq!(zone.size(dead), None);
    assert!(zone.is_thread_local(live));

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_later_mode_evicts_locals_referenced_from_garbage() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();

    let survivor = scanned(&zone, 32);
    let garbage = scanned(&zone, 32);
    unsafe { zone.write_barrier(garbage, survivor) };
    let stack = [survivor];
    publish(&thread, &stack);

    let outcome = zone.collect_local_with(FinalizeMode::Later).unwrap();
    assert_eq!(outcome.garbage, vec![garbage]);
    assert_eq!(outcome.evicted, 1);
    assert!(!zone.is_thread_local(survivor));
    assert!(zone.size(survivor).is_some());

    zone.drain_tasks();
    assert!(zone.size(survivor).is_some());

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_suspended_mode_hands_garbage_to_global_collector() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();

    let live = scanned(&zone, 32);
    let dead = scanned(&zone, 32);
    let stack = [live];
    publish(&thread, &stack);

    thread.suspend();
    let outcome = zone.collect_local_with(FinalizeMode::Suspended).unwrap();
    thread.resume();

    assert_eq!(outcome.garbage, vec![dead]);
    assert!(!zone.block_flags(dead).unwrap().contains(BlockFlags::THREAD_LOCAL));
    assert!(zone.size(dead).is_some());

    zone.collect(CollectOptions::FULL | CollectOptions::SYNCHRONOUS);
    assert_eq!(zone.size(dead), None);
    assert!(zone.is_thread_local(live));

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

// ===== Heuristics =====

#[test]
fn test_flush_when_locals_stay_above_half_limit() {
    let zone = autozone::Zone::new(manual_config().with_local_limit(10)).unwrap();
    let thread = zone.register_thread().unwrap();

    let blocks: Vec<usize> = (0..6).map(|_| scanned(&zone, 16)).collect();
    publish(&thread, &blocks);

    let outcome = zone.collect_local().unwrap();
    assert!(outcome.garbage.is_empty());
    assert!(outcome.flushed);
    assert_eq!(thread.local_count(), 0);
    for addr in blocks {
        assert!(!zone.is_thread_local(addr));
    }

    thread.clear_stack_ranges();
    zone.unregister_thread().unwrap();
}

#[test]
fn test_allocation_triggers_deferred_collection_at_limit() {
    let zone = autozone::Zone::new(manual_config().with_local_limit(8)).unwrap();
    let thread = zone.register_thread().unwrap();
    publish(&thread, &[]);

    for _ in 0..8 {
        scanned(&zone, 16);
    }
    assert_eq!(thread.local_count(), 8);
    scanned(&zone, 16);

    assert_eq!(thread.local_count(), 1);
    assert_eq!(zone.queued_tasks(), 1);
    assert_eq!(zone.statistics().local_collections, 1);
    zone.drain_tasks();
    assert_eq!(zone.statistics().local_garbage, 8);

    zone.unregister_thread().unwrap();
}

#[test]
fn test_watchdog_collects_suspended_thread() {
    let mut config = manual_config();
    config.watchdog_interval_ms = 0;
    let zone = autozone::Zone::new(config).unwrap();
    let thread = zone.register_thread().unwrap();
    publish(&thread, &[]);

    let block = scanned(&zone, 32);
    thread.suspend();
    assert_eq!(zone.poll_suspended_threads(), 1);
    assert!(!zone.is_thread_local(block));
    assert_eq!(zone.poll_suspended_threads(), 0);
    thread.resume();

    zone.unregister_thread().unwrap();
}

#[test]
fn test_collect_local_requires_registration() {
    let zone = manual_zone();
    assert!(matches!(zone.collect_local(), Err(ZoneError::NotRegistered)));
}

#[test]
fn test_unregister_returns_cached_blocks() {
    let zone = manual_zone();
    let thread = zone.register_thread().unwrap();
    let block = scanned(&zone, 32);
    let before = zone.blocks_in_use();
    publish(&thread, &[]);

    zone.collect_local().unwrap();
    assert_eq!(thread.cached_blocks(), 1);
    assert_eq!(zone.blocks_in_use(), before - 1);

    zone.unregister_thread().unwrap();
    assert_eq!(thread.cached_blocks(), 0);
    assert_eq!(zone.size(block), None);
    let fresh = scanned(&zone, 32);
    assert!(!zone.is_thread_local(fresh));
    unsafe { assert_eq!(heap::load_word(fresh), 0) };
}
