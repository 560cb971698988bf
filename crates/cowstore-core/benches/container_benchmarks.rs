//! Benchmarks for container operations

use cowstore_core::{Allocator, EngineConfig, Lookup, Map, Vector};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn populated_map(size: u64) -> Map<u64, String> {
    let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
    let mut map: Map<u64, String> = alloc.create_snapshot(None).create().unwrap();
    map.bulk_load((0..size).map(|i| (i, format!("value-{}", i))).collect())
        .unwrap();
    map
}

fn bench_map_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_insert");

    for size in [100u64, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
                let mut map: Map<u64, String> = alloc.create_snapshot(None).create().unwrap();
                for i in 0..size {
                    map.insert(i.wrapping_mul(2_654_435_761) % size, format!("value-{}", i))
                        .unwrap();
                }
                black_box(map.len().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_map_lookup(c: &mut Criterion) {
    let map = populated_map(100_000);
    let mut group = c.benchmark_group("map_lookup");

    group.bench_function("existing_key", |b| {
        b.iter(|| black_box(map.get(&50_000).unwrap()))
    });

    group.bench_function("missing_key", |b| {
        b.iter(|| black_box(map.get(&200_000).unwrap()))
    });

    group.bench_function("by_rank", |b| {
        b.iter(|| black_box(map.get_by_rank(75_000).unwrap()))
    });

    group.finish();
}

fn bench_map_scan(c: &mut Criterion) {
    let map = populated_map(10_000);

    c.bench_function("map_range_1000", |b| {
        b.iter(|| black_box(map.range(4_000..5_000).unwrap().count()))
    });
}

fn bench_snapshot_branch_write(c: &mut Criterion) {
    let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
    let base = alloc.create_snapshot(Some("base"));
    let mut map: Map<u64, String> = base.create_named("bench").unwrap();
    map.bulk_load((0..10_000u64).map(|i| (i, i.to_string())).collect())
        .unwrap();
    base.commit().unwrap();

    c.bench_function("branch_and_insert", |b| {
        b.iter(|| {
            let branch = base.branch(None).unwrap();
            let mut copy: Map<u64, String> = branch.open_named("bench").unwrap();
            copy.insert(10_001, "new".to_string()).unwrap();
            black_box(branch.drop_snapshot().unwrap())
        })
    });
}

fn bench_vector_push(c: &mut Criterion) {
    c.bench_function("vector_push_1000", |b| {
        b.iter(|| {
            let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
            let mut vector: Vector<u64> = alloc.create_snapshot(None).create().unwrap();
            for i in 0..1_000u64 {
                vector.push(i).unwrap();
            }
            black_box(vector.len().unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_map_insert,
    bench_map_lookup,
    bench_map_scan,
    bench_snapshot_branch_write,
    bench_vector_push,
);
criterion_main!(benches);
