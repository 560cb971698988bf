//! Benchmarks for BlockStore operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cowstore_blockstore::{Block, BlockHeader, BlockKind, BlockStore, CachedBlockStore, MemoryBlockStore};

fn generate_block(size: usize) -> Block {
    let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    Block::new(BlockHeader::new(BlockKind::Leaf, 1, 1), payload)
}

fn bench_write_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("blockstore_write");

    for size in [128, 1024, 4096, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let block = generate_block(size - 32);
            let store = MemoryBlockStore::new();
            b.iter(|| {
                let id = store.allocate(size).unwrap();
                store.write(&id, &block).unwrap();
                black_box(id)
            });
        });
    }

    group.finish();
}

fn bench_read_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("blockstore_read");

    for size in [128, 4096, 64 * 1024].iter() {
        let store = MemoryBlockStore::new();
        let id = store.allocate(*size).unwrap();
        store.write(&id, &generate_block(size - 32)).unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("verified", size), size, |b, _| {
            b.iter(|| black_box(store.read(&id).unwrap()));
        });

        let cached = CachedBlockStore::new(store.clone(), 16);
        group.bench_with_input(BenchmarkId::new("cached", size), size, |b, _| {
            b.iter(|| black_box(cached.read(&id).unwrap()));
        });
    }

    group.finish();
}

fn bench_persist(c: &mut Criterion) {
    let store = MemoryBlockStore::new();
    for _ in 0..1024 {
        let id = store.allocate(4096).unwrap();
        store.write(&id, &generate_block(1024)).unwrap();
    }

    c.bench_function("blockstore_persist_1024", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            store.persist(&mut out).unwrap();
            black_box(out)
        });
    });
}

criterion_group!(benches, bench_write_block, bench_read_block, bench_persist);

criterion_main!(benches);
