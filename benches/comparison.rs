//! Comparison benchmarks: the two concurrent engines against the coarse
//! mutex tree, a skiplist and a mutexed `BTreeSet`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_skiplist::SkipSet;
use grove::{CoarseTree, FineTree, PalmTree};
use parking_lot::Mutex;
use rand::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

const N: i64 = 10_000;
const ORDER: usize = 64;

fn shuffled_keys(seed: u64) -> Vec<i64> {
    let mut keys: Vec<i64> = (0..N).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    keys
}

fn bench_insert(c: &mut Criterion) {
    let keys = shuffled_keys(42);
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(N as u64));

    group.bench_function(BenchmarkId::new("fine", N), |b| {
        b.iter(|| {
            let tree = FineTree::new(ORDER);
            for &key in &keys {
                tree.insert(key);
            }
            tree
        })
    });
    group.bench_function(BenchmarkId::new("coarse", N), |b| {
        b.iter(|| {
            let tree = CoarseTree::new(ORDER);
            for &key in &keys {
                tree.insert(key);
            }
            tree
        })
    });
    group.bench_function(BenchmarkId::new("palm", N), |b| {
        b.iter(|| {
            let tree: PalmTree<i64> = PalmTree::new(ORDER, 4);
            for &key in &keys {
                tree.insert(key);
            }
            tree.flush();
            tree
        })
    });
    group.bench_function(BenchmarkId::new("skiplist", N), |b| {
        b.iter(|| {
            let set = SkipSet::new();
            for &key in &keys {
                set.insert(key);
            }
            set
        })
    });
    group.bench_function(BenchmarkId::new("mutex-btreeset", N), |b| {
        b.iter(|| {
            let set = Mutex::new(BTreeSet::new());
            for &key in &keys {
                set.lock().insert(key);
            }
            set
        })
    });
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let keys = shuffled_keys(7);
    let fine = FineTree::new(ORDER);
    let coarse = CoarseTree::new(ORDER);
    let palm: PalmTree<i64> = PalmTree::new(ORDER, 4);
    for &key in &keys {
        fine.insert(key);
        coarse.insert(key);
        palm.insert(key);
    }
    palm.flush();

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(N as u64));
    group.bench_function("fine", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &key in &keys {
                hits += usize::from(fine.get(&key).is_some());
            }
            hits
        })
    });
    group.bench_function("coarse", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &key in &keys {
                hits += usize::from(coarse.get(&key).is_some());
            }
            hits
        })
    });
    group.bench_function("palm", |b| {
        b.iter(|| {
            let lookups: Vec<_> = keys.iter().map(|&key| palm.get(key)).collect();
            lookups
                .into_iter()
                .map(|lookup| lookup.wait())
                .filter(Option::is_some)
                .count()
        })
    });
    group.finish();
}

fn bench_concurrent_mixed(c: &mut Criterion) {
    let threads = 4;
    let per_thread = 2_500i64;
    let mut group = c.benchmark_group("concurrent-mixed");
    group.throughput(Throughput::Elements((threads * per_thread) as u64));

    group.bench_function("fine", |b| {
        b.iter(|| {
            let tree = Arc::new(FineTree::new(ORDER));
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let tree = Arc::clone(&tree);
                    thread::spawn(move || {
                        let base = t * per_thread;
                        for i in 0..per_thread {
                            tree.insert(base + i);
                            if i % 3 == 0 {
                                tree.get(&(base + i / 2));
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
    group.bench_function("coarse", |b| {
        b.iter(|| {
            let tree = Arc::new(CoarseTree::new(ORDER));
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let tree = Arc::clone(&tree);
                    thread::spawn(move || {
                        let base = t * per_thread;
                        for i in 0..per_thread {
                            tree.insert(base + i);
                            if i % 3 == 0 {
                                tree.get(&(base + i / 2));
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
    group.bench_function("palm", |b| {
        b.iter(|| {
            let tree: Arc<PalmTree<i64>> = Arc::new(PalmTree::new(ORDER, threads as usize));
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let tree = Arc::clone(&tree);
                    thread::spawn(move || {
                        let base = t * per_thread;
                        for i in 0..per_thread {
                            tree.insert(base + i);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            tree.flush();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_get, bench_concurrent_mixed);
criterion_main!(benches);
