//! Store/load hot path benchmarks using Criterion.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use zswap_cache::{ZswapCacheBuilder, PAGE_SIZE};

fn test_pages() -> Vec<[u8; PAGE_SIZE]> {
    let mut pages = Vec::with_capacity(256);

    // Zero pages (highly compressible)
    for _ in 0..64 {
        pages.push([0u8; PAGE_SIZE]);
    }

    // Repeating pattern
    for i in 0..64 {
        let mut page = [0u8; PAGE_SIZE];
        let pattern = [(i % 256) as u8, ((i + 7) % 256) as u8];
        for (j, byte) in page.iter_mut().enumerate() {
            *byte = pattern[j % 2];
        }
        pages.push(page);
    }

    // Sequential
    for _ in 0..64 {
        let mut page = [0u8; PAGE_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        pages.push(page);
    }

    // Half random, half zero (moderately compressible)
    let mut state = 12345u64;
    for _ in 0..64 {
        let mut page = [0u8; PAGE_SIZE];
        for byte in &mut page[..PAGE_SIZE / 2] {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *byte = (state >> 33) as u8;
        }
        pages.push(page);
    }

    pages
}

fn bench_store(c: &mut Criterion) {
    let pages = test_pages();
    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Bytes((pages.len() * PAGE_SIZE) as u64));

    group.bench_function("mixed_pages", |b| {
        b.iter_batched(
            || {
                let cache = ZswapCacheBuilder::new()
                    .total_ram_bytes(4096 * PAGE_SIZE as u64)
                    .build()
                    .unwrap();
                cache.init(0);
                cache
            },
            |cache| {
                for (offset, page) in pages.iter().enumerate() {
                    let _ = cache.store(0, offset as u64, black_box(page));
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let pages = test_pages();
    let cache = ZswapCacheBuilder::new()
        .total_ram_bytes(4096 * PAGE_SIZE as u64)
        .build()
        .unwrap();
    cache.init(0);
    for (offset, page) in pages.iter().enumerate() {
        cache.store(0, offset as u64, page).unwrap();
    }

    let mut group = c.benchmark_group("load");
    group.throughput(Throughput::Bytes((pages.len() * PAGE_SIZE) as u64));
    group.bench_function("mixed_pages", |b| {
        let mut out = [0u8; PAGE_SIZE];
        b.iter(|| {
            for offset in 0..pages.len() {
                assert!(cache.load(0, offset as u64, black_box(&mut out)));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_store, bench_load);
criterion_main!(benches);
