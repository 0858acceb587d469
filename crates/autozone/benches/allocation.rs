use autozone::defaults::SUBZONE_SIZE;
use autozone::{BlockLayout, CollectOptions, FinalizeMode, WordRange, Zone, ZoneConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn zone(thread_local: bool) -> Arc<Zone> {
    let mut config = ZoneConfig::manual().with_region_size(64 * SUBZONE_SIZE);
    config.thread_local_collection = thread_local;
    config.collection_threshold = usize::MAX;
    config.thread_cache_limit = 2048;
    Zone::new(config).unwrap()
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");
    group.throughput(Throughput::Elements(1000));

    for size in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("global", size), &size, |b, &size| {
            let zone = zone(false);
            b.iter(|| {
                let blocks: Vec<usize> = (0..1000)
                    .map(|_| zone.allocate(black_box(size), BlockLayout::SCANNED, false, false).unwrap())
                    .collect();
                for block in blocks {
                    zone.deallocate(block).unwrap();
                }
            });
        });
    }

    group.bench_function("thread_local_with_collection", |b| {
        let zone = zone(true);
        let thread = zone.register_thread().unwrap();
        unsafe { thread.set_stack_ranges(vec![WordRange::new(0, 0)]) };
        b.iter(|| {
            for _ in 0..1000 {
                black_box(zone.allocate(64, BlockLayout::SCANNED, false, false).unwrap());
            }
            zone.collect_local_with(FinalizeMode::Now).unwrap()
        });
        zone.unregister_thread().unwrap();
    });

    group.finish();
}

fn bench_write_barrier(c: &mut Criterion) {
    let zone = zone(false);
    let holder = zone.allocate(1024, BlockLayout::SCANNED, true, true).unwrap();
    let value = zone.allocate(32, BlockLayout::SCANNED, true, true).unwrap();

    c.bench_function("write_barrier_idle", |b| {
        b.iter(|| {
            for offset in (0..1024).step_by(8) {
                unsafe { zone.write_barrier(holder + offset, black_box(value)) };
            }
        });
    });
}

fn bench_full_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_collection");
    group.sample_size(20);

    for live in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("live_blocks", live), &live, |b, &live| {
            let zone = zone(false);
            for _ in 0..live {
                zone.allocate(48, BlockLayout::SCANNED, true, true).unwrap();
            }
            b.iter(|| zone.collect(CollectOptions::FULL | CollectOptions::SYNCHRONOUS));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_write_barrier, bench_full_collection);
criterion_main!(benches);
