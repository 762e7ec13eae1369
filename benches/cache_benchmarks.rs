//! Plan cache hot-path benchmarks: lookup, insert, recompile, and
//! eviction-candidate selection over varying cache sizes.

use std::cmp::Ordering;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use plancache::external::{FixedPageCounts, IdentityCodec, NoResultCache};
use plancache::heap::EvictionHeap;
use plancache::plan::{PlanDigest, QueryText, SerializedPlan};
use plancache::{Config, PlanCache, Prepare};

fn make_bench_cache(capacity: usize) -> PlanCache {
    let mut config = Config::default();
    config.cache.capacity = capacity;
    PlanCache::new(
        config,
        Arc::new(IdentityCodec),
        Arc::new(FixedPageCounts::new()),
        Arc::new(NoResultCache),
    )
    .expect("cache")
}

fn text(statement: &str) -> QueryText {
    QueryText {
        hashed: statement.to_string(),
        user: statement.to_string(),
        plan: String::new(),
    }
}

fn populate(cache: &PlanCache, entries: usize) {
    for i in 0..entries {
        drop(
            cache
                .insert(text(&format!("q{i}")), SerializedPlan(vec![0; 64]), Vec::new(), false)
                .expect("insert"),
        );
    }
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");
    for size in [64usize, 1024, 16_384] {
        let cache = make_bench_cache(size * 2);
        populate(&cache, size);
        let digest = PlanDigest::of(&format!("q{}", size / 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| match cache.lookup_prepare(&digest) {
                Prepare::Hit(plan) => drop(plan),
                _ => panic!("expected hit"),
            });
        });
    }
    group.finish();
}

fn bench_lookup_miss(c: &mut Criterion) {
    let cache = make_bench_cache(4096);
    populate(&cache, 1024);
    let digest = PlanDigest::of("not cached");

    c.bench_function("lookup_miss", |b| {
        b.iter(|| assert!(matches!(cache.lookup_prepare(&digest), Prepare::Miss)));
    });
}

fn bench_insert_fresh(c: &mut Criterion) {
    c.bench_function("insert_fresh", |b| {
        let cache = make_bench_cache(1 << 30);
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            drop(
                cache
                    .insert(text(&format!("fresh q{i}")), SerializedPlan(vec![0; 64]), Vec::new(), false)
                    .expect("insert"),
            );
        });
    });
}

fn bench_recompile_replacement(c: &mut Criterion) {
    let cache = make_bench_cache(4096);
    populate(&cache, 1);

    c.bench_function("recompile_replacement", |b| {
        b.iter(|| {
            drop(
                cache
                    .insert(text("q0"), SerializedPlan(vec![0; 64]), Vec::new(), true)
                    .expect("recompile"),
            );
        });
    });
}

fn bench_eviction_reservoir(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction_reservoir");
    for scan_size in [1_000u64, 100_000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(scan_size),
            &scan_size,
            |b, &scan_size| {
                let mut heap = EvictionHeap::with_capacity(256, u64::cmp as fn(&u64, &u64) -> Ordering);
                b.iter(|| {
                    heap.clear();
                    // Worst-ish case for a min reservoir: mostly descending
                    // stream, so displacements stay frequent.
                    for v in (0..scan_size).rev() {
                        let _ = heap.try_insert(v);
                    }
                    heap.len()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_lookup_hit,
    bench_lookup_miss,
    bench_insert_fresh,
    bench_recompile_replacement,
    bench_eviction_reservoir,
);
criterion_main!(benches);
