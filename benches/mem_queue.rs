// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MBQueue throughput benchmarks, replacing the teacher's `alloc.rs`
// allocator-strategy bench (this crate drops the `bump_alloc`/`slab_pool`
// features it measured — see DESIGN.md). Exercises the push/peek/drop cycle
// at three chunk sizes, plus the aligned-push path and a pool allocate/free
// round trip in isolation.
//
// Run with:
//   cargo bench --bench mem_queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use imemcore::mbq::{BufferAttr, MBQueue};
use imemcore::pool::MemPool;
use imemcore::shm::ShmKind;
use imemcore::Chunk;

const SMALL: usize = 64;
const MEDIUM: usize = 4096;
const LARGE: usize = 65536;

const SIZES: &[(&str, usize)] = &[("small_64", SMALL), ("medium_4096", MEDIUM), ("large_65536", LARGE)];

fn test_pool() -> std::sync::Arc<MemPool> {
    MemPool::new("bench-mbq", ShmKind::Private, 256 * 65536, true).unwrap()
}

fn chunk_of(pool: &std::sync::Arc<MemPool>, bytes: &[u8]) -> Chunk {
    let block = pool.allocate(bytes.len()).unwrap();
    block.write_at(0, bytes);
    Chunk::new(block, 0, bytes.len())
}

fn bench_push_peek_drop(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbq_push_peek_drop");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let pool = test_pool();
            let attr = BufferAttr {
                max_length: Some((sz * 4) as u32),
                pre_buf: Some(0),
                min_req: Some(1),
                ..Default::default()
            };
            let mut q = MBQueue::new("bench", 0, 1, attr, 0, pool.clone(), false).unwrap();
            let payload = vec![0xABu8; sz];
            b.iter(|| {
                q.push(chunk_of(&pool, &payload), true).unwrap();
                let c = q.peek().unwrap();
                black_box(c.len);
                q.drop(sz);
            });
        });
    }

    group.finish();
}

fn bench_push_aligned(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbq_push_aligned");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let pool = test_pool();
            let attr = BufferAttr {
                max_length: Some((sz * 8) as u32),
                pre_buf: Some(0),
                min_req: Some(4),
                ..Default::default()
            };
            let mut q = MBQueue::new("bench-align", 0, 4, attr, 0, pool.clone(), false).unwrap();
            // Deliberately unaligned input so the aligner's merge path runs.
            let payload = vec![0xCDu8; sz + 3];
            b.iter(|| {
                let delta = q.push_aligned(chunk_of(&pool, &payload), true).unwrap();
                while q.length() > 0 {
                    let c = q.peek().unwrap();
                    let len = c.len;
                    black_box(len);
                    q.drop(len);
                }
                black_box(delta);
            });
        });
    }

    group.finish();
}

fn bench_pool_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_allocate_free");
    group.throughput(Throughput::Elements(1));

    group.bench_function("slot_round_trip", |b| {
        let pool = test_pool();
        b.iter(|| {
            let block = pool.allocate(256).unwrap();
            black_box(&block);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_peek_drop, bench_push_aligned, bench_pool_allocate_free);
criterion_main!(benches);
