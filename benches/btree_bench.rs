use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;

use keeldb::common::types::Rid;
use keeldb::index::btree::BPlusTree;
use keeldb::storage::buffer::BufferPoolManager;

fn create_bench_tree(order: usize) -> BPlusTree<i64, Rid> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(256, path).unwrap());

    // Keep the temp file alive
    std::mem::forget(temp_file);

    BPlusTree::new("bench_idx", buffer_pool, order, order).unwrap()
}

fn btree_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree");

    for order in [16, 64].iter() {
        group.bench_with_input(BenchmarkId::new("insert", order), order, |b, &order| {
            let mut keys: Vec<i64> = (0..10_000).collect();
            keys.shuffle(&mut StdRng::seed_from_u64(42));

            b.iter_batched(
                || create_bench_tree(order),
                |tree| {
                    for &key in &keys {
                        tree.insert(key, Rid::new(key as u32, 0)).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("point_lookup", order), order, |b, &order| {
            let tree = create_bench_tree(order);
            let mut keys: Vec<i64> = (0..10_000).collect();
            keys.shuffle(&mut StdRng::seed_from_u64(42));
            for &key in &keys {
                tree.insert(key, Rid::new(key as u32, 0)).unwrap();
            }

            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| {
                let key = rng.gen_range(0..10_000);
                tree.get_value(&key).unwrap().unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("full_scan", order), order, |b, &order| {
            let tree = create_bench_tree(order);
            for key in 0..10_000i64 {
                tree.insert(key, Rid::new(key as u32, 0)).unwrap();
            }

            b.iter(|| {
                let count = tree.iter().unwrap().count();
                assert_eq!(count, 10_000);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, btree_benchmark);
criterion_main!(benches);
