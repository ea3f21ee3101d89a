//! Managed heap benchmarks
//!
//! - Allocation throughput (small / mixed sizes)
//! - Gen0 collection pause with a varying survivor count
//! - Write barrier cost
//! - Lock-free diagnostic reads
//!
//! Run: cargo bench -p vm-heap --bench heap_bench

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use vm_heap::{
    AllocRequest, CollectionReason, FieldSource, GcConfig, Generation, HandleKind, HeapManager,
    TypeTag,
};

const MB: usize = 1024 * 1024;

fn bench_config() -> GcConfig {
    GcConfig {
        address_space_size: 512 * MB,
        concurrent: false,
        verify_heap: false,
        ..GcConfig::default()
    }
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    for size in [32usize, 256, 4096] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("gen0", size), &size, |b, &size| {
            let heap = HeapManager::new(bench_config()).unwrap();
            b.iter(|| black_box(heap.allocate(size, Generation::Gen0).unwrap()));
        });
    }

    group.bench_function("mixed", |b| {
        let heap = HeapManager::new(bench_config()).unwrap();
        let mut rng = rand::thread_rng();
        b.iter(|| {
            let size = rng.gen_range(24..2048);
            let slots = rng.gen_range(0..4);
            black_box(
                heap.allocate_with(AllocRequest::new(size).ref_slots(slots))
                    .unwrap(),
            )
        });
    });
    group.finish();
}

fn bench_gen0_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("gen0_collection");
    group.sample_size(20);
    for survivors in [0usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(survivors),
            &survivors,
            |b, &survivors| {
                let heap = HeapManager::new(bench_config()).unwrap();
                b.iter(|| {
                    let mut roots = Vec::with_capacity(survivors);
                    for i in 0..5000 {
                        let obj = heap.allocate(64, Generation::Gen0).unwrap();
                        if i < survivors {
                            roots.push(heap.create_handle(HandleKind::Strong, obj).unwrap());
                        }
                    }
                    let summary = heap
                        .induce_collection(Generation::Gen0, CollectionReason::Induced)
                        .unwrap();
                    for root in roots {
                        heap.free_handle(root).unwrap();
                    }
                    black_box(summary)
                });
            },
        );
    }
    group.finish();
}

fn bench_write_barrier(c: &mut Criterion) {
    let heap = HeapManager::new(bench_config()).unwrap();
    let old = heap
        .allocate_with(AllocRequest::new(64).generation(Generation::Gen2).ref_slots(4))
        .unwrap();
    let young = heap.allocate(64, Generation::Gen0).unwrap();
    let peer = heap
        .allocate_with(AllocRequest::new(64).generation(Generation::Gen2))
        .unwrap();

    let mut group = c.benchmark_group("write_barrier");
    group.bench_function("old_to_young", |b| {
        b.iter(|| heap.write_ref(black_box(old), 0, black_box(young)).unwrap());
    });
    group.bench_function("old_to_old", |b| {
        b.iter(|| heap.write_ref(black_box(old), 1, black_box(peer)).unwrap());
    });
    group.finish();
}

fn bench_diagnostic_read(c: &mut Criterion) {
    let heap = HeapManager::new(bench_config()).unwrap();
    heap.allocate(64, Generation::Gen0).unwrap();
    let reader = heap.diagnostics();
    c.bench_function("diagnostic_read/alloc_allocated", |b| {
        b.iter(|| {
            black_box(
                reader
                    .read(0, "alloc_allocated", TypeTag::Address)
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_allocation,
    bench_gen0_collection,
    bench_write_barrier,
    bench_diagnostic_read
);
criterion_main!(benches);
